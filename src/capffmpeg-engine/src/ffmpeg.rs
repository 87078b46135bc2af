use std::{
    collections::VecDeque,
    ffi::OsString,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use capffmpeg_core::{EncoderConfig, ReencodeJob};

use crate::{CancelToken, EngineError, EngineResult, MediaEngine};

const STDERR_TAIL_LINES: usize = 20;
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Why the progress loop stopped.
enum Stop {
    Eof,
    Cancelled,
    ReadFailed(io::Error),
}

/// Engine that drives the system `ffmpeg` binary.
///
/// Video streams are re-encoded to H.264 at the target size; audio and
/// subtitle streams are copied, everything else is dropped.
#[derive(Debug, Clone)]
pub struct FfmpegCliEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegCliEngine {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegCliEngine {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_config(config: &EncoderConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.ffprobe_path)
    }

    fn probe_duration(&self, input: &Path) -> EngineResult<Option<Duration>> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Backend(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(EngineError::Probe {
                path: input.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_duration(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl MediaEngine for FfmpegCliEngine {
    fn name(&self) -> &'static str {
        "ffmpeg-cli"
    }

    fn reencode(
        &self,
        job: &ReencodeJob,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let duration = self.probe_duration(&job.input)?;
        if duration.is_none() {
            tracing::warn!(input = %job.input.display(), "Input has no known duration, progress will only report completion");
        }

        let started = Instant::now();
        let mut child = Command::new(&self.ffmpeg)
            .args(build_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Backend(format!("failed to run ffmpeg: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Io("ffmpeg output pipes unavailable".into()));
        };

        // Keep the last stderr lines for the failure message.
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail_clone = tail.clone();
        let stderr_reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                let mut guard = tail_clone.lock().unwrap();
                if guard.len() == STDERR_TAIL_LINES {
                    guard.pop_front();
                }
                guard.push_back(line);
            }
        });

        let (tx, rx) = mpsc::channel();
        let stdout_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let parsed = match line {
                    Ok(line) => match parse_progress_line(&line) {
                        Some(parsed) => Ok(parsed),
                        None => continue,
                    },
                    Err(err) => Err(err),
                };
                let failed = parsed.is_err();
                if tx.send(parsed).is_err() || failed {
                    return;
                }
            }
        });

        let mut reported_end = false;
        let stop = loop {
            if cancel.is_cancelled() {
                break Stop::Cancelled;
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(Ok(ProgressLine::OutTime(out_time))) => {
                    if let Some(total) = duration {
                        // 1.0 is only reported once the exit status is known.
                        progress(fraction(out_time, total).min(0.99));
                    }
                }
                Ok(Ok(ProgressLine::End)) => reported_end = true,
                Ok(Err(err)) => break Stop::ReadFailed(err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Stop::Eof,
            }
        };

        if !matches!(stop, Stop::Eof) {
            if let Err(err) = child.kill() {
                tracing::warn!(error = %err, "Failed to kill ffmpeg");
            }
        }
        let status = child.wait().map_err(|e| EngineError::Io(e.to_string()));
        let _ = stdout_reader.join();
        let _ = stderr_reader.join();

        match stop {
            Stop::Cancelled => return Err(EngineError::Cancelled),
            Stop::ReadFailed(err) => return Err(EngineError::Io(err.to_string())),
            Stop::Eof => {}
        }
        let status = status?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !status.success() {
            let stderr = tail.lock().unwrap().iter().cloned().collect::<Vec<_>>().join("\n");
            return Err(EngineError::EncoderFailed {
                status: status.to_string(),
                stderr,
            });
        }
        if reported_end {
            progress(1.0);
        }

        tracing::info!(
            output = %job.output.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "ffmpeg finished"
        );
        Ok(())
    }
}

fn build_args(job: &ReencodeJob) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-nostats", "-y", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(job.input.clone().into_os_string());
    for arg in [
        "-map".to_string(),
        "0:v?".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-map".to_string(),
        "0:s?".to_string(),
        "-map_metadata".to_string(),
        "0".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        job.preset.clone(),
        "-b:v".to_string(),
        job.bitrate.to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", job.width, job.height),
        "-c:a".to_string(),
        "copy".to_string(),
        "-c:s".to_string(),
        "copy".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
    ] {
        args.push(OsString::from(arg));
    }
    args.push(job.output.clone().into_os_string());
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressLine {
    OutTime(Duration),
    End,
}

/// Parses one `key=value` line of ffmpeg's `-progress` output.
fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // out_time_ms is microseconds too, despite its name.
        "out_time_us" | "out_time_ms" => value
            .parse::<u64>()
            .ok()
            .map(|us| ProgressLine::OutTime(Duration::from_micros(us))),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

fn parse_duration(output: &str) -> Option<Duration> {
    let seconds: f64 = output.lines().next()?.trim().parse().ok()?;
    (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn fraction(done: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    (done.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ReencodeJob {
        ReencodeJob {
            input: PathBuf::from("/videos/in.mov"),
            output: PathBuf::from("/videos/out.mp4"),
            width: 960,
            height: 540,
            bitrate: 2_097_152,
            preset: "medium".into(),
        }
    }

    #[test]
    fn args_scale_and_set_bitrate() {
        let args: Vec<String> = build_args(&job())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let pair = |flag: &str| {
            let idx = args.iter().position(|a| a == flag).expect(flag);
            args[idx + 1].clone()
        };
        assert_eq!(pair("-i"), "/videos/in.mov");
        assert_eq!(pair("-vf"), "scale=960:540");
        assert_eq!(pair("-b:v"), "2097152");
        assert_eq!(pair("-c:v"), "libx264");
        assert_eq!(pair("-preset"), "medium");
        assert_eq!(pair("-c:a"), "copy");
        assert_eq!(pair("-progress"), "pipe:1");
        assert_eq!(args.last().map(String::as_str), Some("/videos/out.mp4"));
    }

    #[test]
    fn progress_lines_parse() {
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(ProgressLine::OutTime(Duration::from_millis(1500)))
        );
        assert_eq!(
            parse_progress_line("out_time_ms=250000\n"),
            Some(ProgressLine::OutTime(Duration::from_millis(250)))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressLine::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("frame=12"), None);
    }

    #[test]
    fn duration_parses_first_line() {
        assert_eq!(parse_duration("12.500000\n"), Some(Duration::from_millis(12_500)));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("0.0"), None);
    }

    #[test]
    fn fraction_is_clamped() {
        let total = Duration::from_secs(10);
        assert_eq!(fraction(Duration::from_secs(5), total), 0.5);
        assert_eq!(fraction(Duration::from_secs(20), total), 1.0);
        assert_eq!(fraction(Duration::from_secs(1), Duration::ZERO), 0.0);
    }

    // Serialises tests that spawn processes, so no fork inherits a stub
    // script that is still open for writing.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn stub_engine(dir: &Path, ffmpeg_body: &str) -> FfmpegCliEngine {
        let ffprobe = write_script(dir, "ffprobe", "echo 10.0");
        let ffmpeg = write_script(dir, "ffmpeg", ffmpeg_body);
        FfmpegCliEngine::new(ffmpeg, ffprobe)
    }

    #[cfg(unix)]
    fn run_collecting(
        engine: &FfmpegCliEngine,
        cancel_after_first: bool,
    ) -> (Vec<f64>, EngineResult<()>) {
        let seen = Mutex::new(Vec::new());
        let cancel = CancelToken::new();
        let result = engine.reencode(
            &job(),
            &|p: f64| {
                seen.lock().unwrap().push(p);
                if cancel_after_first {
                    cancel.cancel();
                }
            },
            &cancel,
        );
        (seen.into_inner().unwrap(), result)
    }

    #[cfg(unix)]
    #[test]
    fn completion_reported_after_clean_exit() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let engine = stub_engine(
            dir.path(),
            "echo out_time_us=4000000\necho progress=continue\necho out_time_us=6000000\necho progress=end",
        );

        let (seen, result) = run_collecting(&engine, false);
        result.expect("stub encoder exits cleanly");
        assert_eq!(seen, vec![0.4, 0.6, 1.0]);
    }

    #[cfg(unix)]
    #[test]
    fn late_failure_never_reports_completion() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let engine = stub_engine(
            dir.path(),
            "echo out_time_us=4000000\necho out_time_us=6000000\necho progress=end\necho 'Error while writing trailer' >&2\nexit 1",
        );

        let (seen, result) = run_collecting(&engine, false);
        assert_eq!(seen, vec![0.4, 0.6]);
        match result {
            Err(EngineError::EncoderFailed { stderr, .. }) => {
                assert!(stderr.contains("Error while writing trailer"));
            }
            other => panic!("expected encoder failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_a_silent_encoder() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let engine = stub_engine(dir.path(), "echo out_time_us=1000000\nexec sleep 30");

        let started = Instant::now();
        let (seen, result) = run_collecting(&engine, true);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(seen, vec![0.1]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_ffprobe_is_backend_error() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let engine = FfmpegCliEngine::new(dir.path().join("ffmpeg"), dir.path().join("ffprobe"));
        let result = engine.reencode(&job(), &|_: f64| {}, &CancelToken::new());
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }
}
