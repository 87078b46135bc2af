use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use capffmpeg_core::ReencodeJob;
use thiserror::Error;

/// Re-encoding errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("media backend unavailable: {0}")]
    Backend(String),
    #[error("failed to probe {path}: {message}")]
    Probe { path: String, message: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("encoder exited with {status}: {stderr}")]
    EncoderFailed { status: String, stderr: String },
    #[error("re-encode cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Shared flag a running job polls to find out it should stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Re-encoding backend interface.
///
/// `reencode` blocks until the job finishes, fails, or notices `cancel`.
/// `progress` receives fractions in `0.0..=1.0`; backends should not report
/// `1.0` before the output is complete.
pub trait MediaEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn reencode(
        &self,
        job: &ReencodeJob,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancelToken,
    ) -> EngineResult<()>;
}

/// No-op engine used for tests and headless environments.
///
/// Walks through `steps` ticks, reporting progress after each, and never
/// touches the filesystem.
#[derive(Debug, Clone)]
pub struct NullMediaEngine {
    steps: u32,
    tick: Duration,
}

impl Default for NullMediaEngine {
    fn default() -> Self {
        // Simulate ~0.5 seconds of encoding.
        Self {
            steps: 10,
            tick: Duration::from_millis(50),
        }
    }
}

impl NullMediaEngine {
    pub fn new(steps: u32, tick: Duration) -> Self {
        Self {
            steps: steps.max(1),
            tick,
        }
    }

    /// Completes without sleeping.
    pub fn instant() -> Self {
        Self::new(4, Duration::ZERO)
    }
}

impl MediaEngine for NullMediaEngine {
    fn name(&self) -> &'static str {
        "null"
    }

    fn reencode(
        &self,
        job: &ReencodeJob,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        tracing::debug!(
            input = %job.input.display(),
            output = %job.output.display(),
            steps = self.steps,
            "Simulating re-encode"
        );
        for step in 1..=self.steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.tick.is_zero() {
                thread::sleep(self.tick);
            }
            progress(f64::from(step) / f64::from(self.steps));
        }
        Ok(())
    }
}
