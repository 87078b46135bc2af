/// Returns its input unchanged. An absent value stays absent.
pub fn echo(value: Option<String>) -> Option<String> {
    value
}
