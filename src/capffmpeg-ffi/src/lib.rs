//! C ABI over the capffmpeg bridge, for native mobile shells.
//!
//! Ownership rules:
//! - `capffmpeg_init*` returns an opaque plugin pointer; release it with
//!   `capffmpeg_deinit`.
//! - Strings returned as `*mut c_char` are owned by the caller; release them
//!   with `capffmpeg_free_string`.
//! - `*mut CResult` values are owned by the caller; release them with
//!   `capffmpeg_free_result`.
//! - `capffmpeg_plugin_version` returns a static string that must not be freed.

use capffmpeg_bridge::{
    CallOutcome, FfmpegPlugin, HostFrame, JobState, PluginCall, PluginEvent, PluginRegistration,
};
use capffmpeg_core::{echo, Config, EncoderConfig, ReencodeRequest, PLUGIN_VERSION};
use capffmpeg_engine::{FfmpegCliEngine, MediaEngine, NullMediaEngine};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, OnceLock};

/// Result handed back across the C boundary.
#[repr(C)]
pub struct CResult {
    pub ok: bool,
    /// NULL when `ok` is true.
    pub error_message: *mut c_char,
}

impl CResult {
    fn success() -> *mut CResult {
        Box::into_raw(Box::new(CResult {
            ok: true,
            error_message: ptr::null_mut(),
        }))
    }

    fn error(message: impl Into<String>) -> *mut CResult {
        let message = message.into();
        tracing::warn!(%message, "Returning error across C boundary");
        Box::into_raw(Box::new(CResult {
            ok: false,
            error_message: into_c_string(message),
        }))
    }
}

/// Progress callback. A non-zero return is logged and otherwise ignored.
pub type ProgressCallback = extern "C" fn(progress: f64, user_data: *mut c_void) -> c_int;

/// Completion callback. `error_message` is NULL on success, equals
/// [`CANCELLED_MESSAGE`] for cancelled jobs, and is only valid for the
/// duration of the call.
pub type FinishedCallback =
    extern "C" fn(ok: bool, error_message: *const c_char, user_data: *mut c_void);

/// Message handed to the completion callback when a job was cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled";

fn finished_message(state: JobState, error: Option<&str>) -> Option<&str> {
    match state {
        JobState::Completed => None,
        JobState::Cancelled => Some(CANCELLED_MESSAGE),
        JobState::Failed | JobState::Running => Some(error.unwrap_or("Video re-encoding failed")),
    }
}

struct PluginHandle {
    plugin: FfmpegPlugin,
    registration: PluginRegistration,
}

/// Opaque host pointer passed back to callbacks untouched.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// The host promises the pointer may be used from worker threads.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn get(self) -> *mut c_void {
        self.0
    }
}

fn into_c_string(value: String) -> *mut c_char {
    CString::new(value.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}

/// Returns None for NULL or invalid UTF-8.
unsafe fn c_str_to_string(value: *const c_char) -> Option<String> {
    if value.is_null() {
        return None;
    }
    CStr::from_ptr(value).to_str().ok().map(str::to_string)
}

unsafe fn handle<'a>(plugin: *mut c_void) -> Option<&'a PluginHandle> {
    (plugin as *const PluginHandle).as_ref()
}

fn init_with(engine: Arc<dyn MediaEngine>, encoder: EncoderConfig) -> *mut c_void {
    match FfmpegPlugin::new(engine, encoder) {
        Ok(plugin) => Box::into_raw(Box::new(PluginHandle {
            plugin,
            registration: PluginRegistration::ffmpeg(),
        })) as *mut c_void,
        Err(err) => {
            tracing::error!(error = %err, "Failed to initialize FFmpeg plugin");
            ptr::null_mut()
        }
    }
}

/// Creates a plugin backed by the system ffmpeg.
///
/// # Safety
///
/// `config_path` must be NULL or a valid NUL-terminated string. NULL selects
/// the default encoder settings.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_init(config_path: *const c_char) -> *mut c_void {
    let encoder = if config_path.is_null() {
        EncoderConfig::default()
    } else {
        let Some(path) = c_str_to_string(config_path) else {
            tracing::error!("Config path is not valid UTF-8");
            return ptr::null_mut();
        };
        match Config::load_from(Path::new(&path)) {
            Ok(config) => config.encoder,
            Err(err) => {
                tracing::error!(error = %err, "Failed to load config");
                return ptr::null_mut();
            }
        }
    };

    let engine = Arc::new(FfmpegCliEngine::from_config(&encoder));
    init_with(engine, encoder)
}

/// Creates a plugin whose jobs are simulated. Useful for UI work on devices
/// without an encoder.
#[no_mangle]
pub extern "C" fn capffmpeg_init_simulated() -> *mut c_void {
    init_with(Arc::new(NullMediaEngine::default()), EncoderConfig::default())
}

/// Cancels running jobs, waits for them and frees the plugin.
///
/// # Safety
///
/// `plugin` must be NULL or a pointer returned by `capffmpeg_init*` that has
/// not been released yet.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_deinit(plugin: *mut c_void) {
    if plugin.is_null() {
        return;
    }
    let handle = Box::from_raw(plugin as *mut PluginHandle);
    handle.plugin.destroy();
}

/// Returns a copy of `value`, or NULL when `value` is NULL.
///
/// # Safety
///
/// `value` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_echo(value: *const c_char) -> *mut c_char {
    match echo(c_str_to_string(value)) {
        Some(value) => into_c_string(value),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn capffmpeg_plugin_version() -> *const c_char {
    static VERSION: OnceLock<CString> = OnceLock::new();
    VERSION
        .get_or_init(|| CString::new(PLUGIN_VERSION).unwrap_or_default())
        .as_ptr()
}

/// # Safety
///
/// `value` must be NULL or a string returned by this library.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_free_string(value: *mut c_char) {
    if !value.is_null() {
        drop(CString::from_raw(value));
    }
}

/// # Safety
///
/// `result` must be NULL or a pointer returned by this library.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_free_result(result: *mut CResult) {
    if result.is_null() {
        return;
    }
    let result = Box::from_raw(result);
    if !result.error_message.is_null() {
        drop(CString::from_raw(result.error_message));
    }
}

/// Schedules a re-encode. Returns once the job is queued; progress and the
/// outcome arrive through the callbacks on a worker thread.
///
/// `bitrate <= 0` selects the default bitrate.
///
/// # Safety
///
/// `plugin` must come from `capffmpeg_init*`; the path arguments must be NULL
/// or valid NUL-terminated strings; `user_data` must stay valid until the
/// finished callback has run.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn capffmpeg_reencode_video(
    plugin: *mut c_void,
    input_path: *const c_char,
    output_path: *const c_char,
    width: c_int,
    height: c_int,
    bitrate: c_int,
    user_data: *mut c_void,
    on_progress: Option<ProgressCallback>,
    on_finished: Option<FinishedCallback>,
) -> *mut CResult {
    let Some(handle) = handle(plugin) else {
        return CResult::error("Plugin pointer is null");
    };
    let Some(input_path) = c_str_to_string(input_path) else {
        return CResult::error("Invalid input path");
    };
    let Some(output_path) = c_str_to_string(output_path) else {
        return CResult::error("Invalid output path");
    };
    if height <= 0 {
        return CResult::error(format!("Height must be between 0 and {}", c_int::MAX));
    }
    if width <= 0 {
        return CResult::error(format!("Width must be between 0 and {}", c_int::MAX));
    }

    let request = ReencodeRequest {
        input_path,
        output_path,
        width: width as u32,
        height: height as u32,
        bitrate: (bitrate > 0).then_some(bitrate as u64),
    };

    let user_data = UserData(user_data);
    let observer = Box::new(move |event: &PluginEvent| match event {
        PluginEvent::Progress { progress, file_id } => {
            if let Some(callback) = on_progress {
                if callback(*progress, user_data.get()) != 0 {
                    tracing::warn!(file_id = %file_id, "Failed to inform about progress");
                }
            }
        }
        PluginEvent::ReencodeFinished { state, error, .. } => {
            if let Some(callback) = on_finished {
                let message = finished_message(*state, error.as_deref())
                    .map(|m| CString::new(m.replace('\0', " ")).unwrap_or_default());
                let message_ptr = message.as_ref().map_or(ptr::null(), |m| m.as_ptr());
                callback(*state == JobState::Completed, message_ptr, user_data.get());
            }
        }
    });

    match handle.plugin.reencode_video_observed(&request, observer) {
        Ok(file_id) => {
            tracing::info!(file_id = %file_id, "Re-encode scheduled from native shell");
            CResult::success()
        }
        Err(err) => CResult::error(format!("Video re-encoding failed: {err}")),
    }
}

/// Dispatches a JSON call through the registration table and returns the
/// JSON response frame.
///
/// # Safety
///
/// `plugin` must come from `capffmpeg_init*`; `call_json` must be NULL or a
/// valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn capffmpeg_call(plugin: *mut c_void, call_json: *const c_char) -> *mut c_char {
    let (id, outcome) = match (handle(plugin), c_str_to_string(call_json)) {
        (None, _) => (0, CallOutcome::reject("Plugin pointer is null")),
        (Some(_), None) => (0, CallOutcome::reject("Call is not a valid string")),
        (Some(handle), Some(json)) => match serde_json::from_str::<PluginCall>(&json) {
            Ok(call) => (call.id, handle.registration.dispatch(&handle.plugin, &call)),
            Err(err) => (0, CallOutcome::reject(format!("Malformed call: {err}"))),
        },
    };

    match serde_json::to_string(&HostFrame::Response { id, outcome }) {
        Ok(json) => into_c_string(json),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode response frame");
            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    unsafe fn take_string(value: *mut c_char) -> Option<String> {
        if value.is_null() {
            return None;
        }
        let owned = CStr::from_ptr(value).to_string_lossy().into_owned();
        capffmpeg_free_string(value);
        Some(owned)
    }

    #[test]
    fn echo_round_trips_and_null_stays_null() {
        let input = CString::new("hello").unwrap();
        unsafe {
            assert_eq!(take_string(capffmpeg_echo(input.as_ptr())).as_deref(), Some("hello"));
            assert!(capffmpeg_echo(ptr::null()).is_null());
        }
    }

    #[test]
    fn version_is_static() {
        let first = capffmpeg_plugin_version();
        let second = capffmpeg_plugin_version();
        assert_eq!(first, second);
        let version = unsafe { CStr::from_ptr(first) };
        assert_eq!(version.to_str().unwrap(), "0.0.2");
    }

    #[test]
    fn null_plugin_reported_not_dereferenced() {
        let input = CString::new("in.mov").unwrap();
        unsafe {
            let result = capffmpeg_reencode_video(
                ptr::null_mut(),
                input.as_ptr(),
                input.as_ptr(),
                640,
                360,
                0,
                ptr::null_mut(),
                None,
                None,
            );
            assert!(!(*result).ok);
            assert_eq!(
                CStr::from_ptr((*result).error_message).to_str().unwrap(),
                "Plugin pointer is null"
            );
            capffmpeg_free_result(result);
        }
    }

    #[test]
    fn call_dispatches_json() {
        let plugin = capffmpeg_init_simulated();
        assert!(!plugin.is_null());
        let call = CString::new(r#"{"id":3,"method":"getPluginVersion"}"#).unwrap();
        unsafe {
            let response = take_string(capffmpeg_call(plugin, call.as_ptr())).unwrap();
            let frame: serde_json::Value = serde_json::from_str(&response).unwrap();
            assert_eq!(frame["id"], 3);
            assert_eq!(frame["outcome"]["data"]["version"], "0.0.2");

            let garbage = CString::new("{").unwrap();
            let response = take_string(capffmpeg_call(plugin, garbage.as_ptr())).unwrap();
            assert!(response.contains("Malformed call"));
            capffmpeg_deinit(plugin);
        }
    }

    static PROGRESS_CALLS: AtomicU32 = AtomicU32::new(0);
    static FINISHED: Mutex<Option<bool>> = Mutex::new(None);

    extern "C" fn count_progress(_progress: f64, _user_data: *mut c_void) -> c_int {
        PROGRESS_CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    extern "C" fn record_finished(ok: bool, _message: *const c_char, _user_data: *mut c_void) {
        *FINISHED.lock().unwrap() = Some(ok);
    }

    #[test]
    fn simulated_reencode_invokes_callbacks() {
        let plugin = capffmpeg_init_simulated();
        let input = CString::new("file:///videos/in.mov").unwrap();
        let output = CString::new("/videos/out.mp4").unwrap();
        unsafe {
            let result = capffmpeg_reencode_video(
                plugin,
                input.as_ptr(),
                output.as_ptr(),
                960,
                540,
                2_097_152,
                ptr::null_mut(),
                Some(count_progress),
                Some(record_finished),
            );
            assert!((*result).ok);
            capffmpeg_free_result(result);

            let handle = handle(plugin).unwrap();
            handle.plugin.wait_all();
            capffmpeg_deinit(plugin);
        }
        assert!(PROGRESS_CALLS.load(Ordering::SeqCst) >= 1);
        assert_eq!(*FINISHED.lock().unwrap(), Some(true));
    }

    static CANCELLED_WITH: Mutex<Option<(bool, String)>> = Mutex::new(None);

    extern "C" fn record_cancelled(ok: bool, message: *const c_char, _user_data: *mut c_void) {
        let message = if message.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
        };
        *CANCELLED_WITH.lock().unwrap() = Some((ok, message));
    }

    #[test]
    fn cancelled_job_is_distinguishable_from_failure() {
        let plugin = capffmpeg_init_simulated();
        let input = CString::new("/videos/in.mov").unwrap();
        let output = CString::new("/videos/out.mp4").unwrap();
        unsafe {
            let result = capffmpeg_reencode_video(
                plugin,
                input.as_ptr(),
                output.as_ptr(),
                640,
                360,
                0,
                ptr::null_mut(),
                None,
                Some(record_cancelled),
            );
            assert!((*result).ok);
            capffmpeg_free_result(result);
            capffmpeg_deinit(plugin);
        }
        assert_eq!(
            *CANCELLED_WITH.lock().unwrap(),
            Some((false, CANCELLED_MESSAGE.to_string()))
        );
    }

    #[test]
    fn finished_message_per_state() {
        assert_eq!(finished_message(JobState::Completed, None), None);
        assert_eq!(finished_message(JobState::Cancelled, None), Some("cancelled"));
        assert_eq!(finished_message(JobState::Failed, Some("boom")), Some("boom"));
        assert_eq!(
            finished_message(JobState::Failed, None),
            Some("Video re-encoding failed")
        );
    }

    #[test]
    fn init_with_bad_config_returns_null() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "config_version = 99").unwrap();
        let path = CString::new(file.path().to_string_lossy().into_owned()).unwrap();
        let plugin = unsafe { capffmpeg_init(path.as_ptr()) };
        assert!(plugin.is_null());
    }
}
