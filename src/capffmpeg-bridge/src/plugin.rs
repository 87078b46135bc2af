//! The plugin object behind the bridge: owns the encoder worker pool, the
//! job table and the event listeners.

use crate::events::{EventBus, JobState, Listener, ListenerId, PluginEvent};
use capffmpeg_core::{EncoderConfig, ReencodeError, ReencodeRequest};
use capffmpeg_engine::{CancelToken, EngineError, MediaEngine};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

/// Finished jobs whose state stays queryable after they leave the table.
const FINISHED_HISTORY: usize = 32;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start encoder workers: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Reencode(#[from] ReencodeError),
}

struct JobEntry {
    state: Arc<Mutex<JobState>>,
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    fn is_done(&self) -> bool {
        self.state().is_finished() && self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

#[derive(Default)]
struct JobTable {
    active: HashMap<String, JobEntry>,
    finished: VecDeque<(String, JobState)>,
}

impl JobTable {
    /// Moves finished jobs out of `active`, keeping the last
    /// [`FINISHED_HISTORY`] states.
    fn prune(&mut self) {
        let done: Vec<String> = self
            .active
            .iter()
            .filter(|(_, entry)| entry.is_done())
            .map(|(id, _)| id.clone())
            .collect();
        for id in done {
            if let Some(entry) = self.active.remove(&id) {
                if self.finished.len() == FINISHED_HISTORY {
                    self.finished.pop_front();
                }
                self.finished.push_back((id, entry.state()));
            }
        }
    }

    fn state(&self, file_id: &str) -> Option<JobState> {
        match self.active.get(file_id) {
            Some(entry) => Some(entry.state()),
            None => self
                .finished
                .iter()
                .find(|(id, _)| id == file_id)
                .map(|(_, state)| *state),
        }
    }
}

pub struct FfmpegPlugin {
    engine: Arc<dyn MediaEngine>,
    encoder: EncoderConfig,
    runtime: Runtime,
    jobs: Mutex<JobTable>,
    events: Arc<EventBus>,
    next_job: AtomicU64,
}

impl std::fmt::Debug for FfmpegPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegPlugin")
            .field("engine", &self.engine.name())
            .field("encoder", &self.encoder)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl FfmpegPlugin {
    pub fn new(engine: Arc<dyn MediaEngine>, encoder: EncoderConfig) -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(encoder.worker_threads.max(1))
            .max_blocking_threads(encoder.worker_threads.max(1))
            .thread_name("ffmpeg-worker")
            .build()
            .map_err(BridgeError::Runtime)?;

        tracing::info!(
            engine = engine.name(),
            workers = encoder.worker_threads,
            preset = %encoder.preset,
            "Plugin loaded"
        );

        Ok(Self {
            engine,
            encoder,
            runtime,
            jobs: Mutex::new(JobTable::default()),
            events: Arc::new(EventBus::new()),
            next_job: AtomicU64::new(1),
        })
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.events.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove(id)
    }

    /// Validates the request and schedules it on the worker pool.
    ///
    /// Returns the job's `fileId` as soon as the job is queued. Progress and
    /// the final outcome arrive as events carrying the same id.
    pub fn reencode_video(&self, request: &ReencodeRequest) -> Result<String, BridgeError> {
        self.schedule(request, None)
    }

    /// Like [`reencode_video`](Self::reencode_video), but `observer` also
    /// receives this job's events, starting with the first one.
    pub fn reencode_video_observed(
        &self,
        request: &ReencodeRequest,
        observer: Listener,
    ) -> Result<String, BridgeError> {
        self.schedule(request, Some(observer))
    }

    fn schedule(
        &self,
        request: &ReencodeRequest,
        observer: Option<Listener>,
    ) -> Result<String, BridgeError> {
        let job = request.validate(&self.encoder.bitrate_limits(), &self.encoder.preset)?;
        let file_id = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));

        let state = Arc::new(Mutex::new(JobState::Running));
        let cancel = CancelToken::new();

        tracing::info!(
            file_id = %file_id,
            input = %job.input.display(),
            output = %job.output.display(),
            width = job.width,
            height = job.height,
            bitrate = job.bitrate,
            "Scheduling re-encode"
        );

        // The table stays locked until the entry is in, so `destroy` and
        // `wait_all` always see a spawned job.
        let mut jobs = self.jobs.lock().unwrap();
        jobs.prune();

        let task = {
            let engine = self.engine.clone();
            let events = self.events.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            let file_id = file_id.clone();
            self.runtime.spawn_blocking(move || {
                let notify = |event: &PluginEvent| {
                    events.emit(event);
                    if let Some(observer) = &observer {
                        observer(event);
                    }
                };
                run_job(engine.as_ref(), &job, &notify, &state, &cancel, &file_id);
            })
        };

        jobs.active.insert(
            file_id.clone(),
            JobEntry {
                state,
                cancel,
                task: Some(task),
            },
        );
        Ok(file_id)
    }

    /// State of a running job, or of one of the most recently finished ones.
    pub fn job_state(&self, file_id: &str) -> Option<JobState> {
        self.jobs.lock().unwrap().state(file_id)
    }

    /// Asks a running job to stop. Returns false for unknown or finished ids.
    pub fn cancel(&self, file_id: &str) -> bool {
        match self.jobs.lock().unwrap().active.get(file_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Blocks until the job finishes and returns its final state.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(&self, file_id: &str) -> Option<JobState> {
        let task = self
            .jobs
            .lock()
            .unwrap()
            .active
            .get_mut(file_id)
            .and_then(|entry| entry.task.take());
        if let Some(task) = task {
            if let Err(err) = self.runtime.block_on(task) {
                tracing::error!(file_id, error = %err, "Re-encode task panicked");
            }
        }
        self.job_state(file_id)
    }

    /// Blocks until every scheduled job has finished.
    pub fn wait_all(&self) {
        let ids: Vec<String> = self.jobs.lock().unwrap().active.keys().cloned().collect();
        for id in ids {
            self.wait(&id);
        }
    }

    /// Cancels every running job and waits for the workers to wind down.
    pub fn destroy(&self) {
        {
            let jobs = self.jobs.lock().unwrap();
            for entry in jobs.active.values() {
                entry.cancel.cancel();
            }
        }
        self.wait_all();
        tracing::info!("Plugin destroyed");
    }

    #[cfg(test)]
    fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap().active.len()
    }
}

impl Drop for FfmpegPlugin {
    fn drop(&mut self) {
        // Runtime shutdown waits on blocking tasks; make sure they are winding down.
        if let Ok(jobs) = self.jobs.lock() {
            for entry in jobs.active.values() {
                entry.cancel.cancel();
            }
        }
    }
}

fn run_job(
    engine: &dyn MediaEngine,
    job: &capffmpeg_core::ReencodeJob,
    notify: &(dyn Fn(&PluginEvent) + Send + Sync),
    state: &Mutex<JobState>,
    cancel: &CancelToken,
    file_id: &str,
) {
    let last = Mutex::new(0.0_f64);
    let report = |progress: f64| {
        let progress = progress.clamp(0.0, 1.0);
        {
            let mut last = last.lock().unwrap();
            if progress < *last {
                return;
            }
            *last = progress;
        }
        notify(&PluginEvent::Progress {
            progress,
            file_id: file_id.to_string(),
        });
    };

    let result = engine.reencode(job, &report, cancel);

    let (final_state, error) = match result {
        Ok(()) => {
            if *last.lock().unwrap() < 1.0 {
                report(1.0);
            }
            tracing::info!(file_id, "Video re-encoding completed successfully");
            (JobState::Completed, None)
        }
        Err(EngineError::Cancelled) => {
            tracing::warn!(file_id, "Video re-encoding cancelled");
            (JobState::Cancelled, None)
        }
        Err(err) => {
            tracing::error!(file_id, error = %err, "Video re-encoding failed");
            (JobState::Failed, Some(err.to_string()))
        }
    };

    *state.lock().unwrap() = final_state;
    notify(&PluginEvent::ReencodeFinished {
        file_id: file_id.to_string(),
        state: final_state,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use capffmpeg_core::ReencodeJob;
    use capffmpeg_engine::{EngineResult, NullMediaEngine};
    use std::time::Duration;

    fn request() -> ReencodeRequest {
        ReencodeRequest {
            input_path: "file:///tmp/in.mov".into(),
            output_path: "/tmp/out.mp4".into(),
            width: 960,
            height: 540,
            bitrate: Some(2_097_152),
        }
    }

    fn plugin_with(engine: impl MediaEngine + 'static) -> FfmpegPlugin {
        FfmpegPlugin::new(Arc::new(engine), EncoderConfig::default()).expect("plugin should start")
    }

    fn record_events(plugin: &FfmpegPlugin) -> Arc<Mutex<Vec<PluginEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        plugin.add_listener(Box::new(move |event: &PluginEvent| {
            seen_clone.lock().unwrap().push(event.clone());
        }));
        seen
    }

    struct FailingEngine;

    impl MediaEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn reencode(
            &self,
            _job: &ReencodeJob,
            progress: &(dyn Fn(f64) + Send + Sync),
            _cancel: &CancelToken,
        ) -> EngineResult<()> {
            progress(0.4);
            progress(0.2);
            Err(EngineError::Other("decoder exploded".into()))
        }
    }

    #[test]
    fn completed_job_reports_progress_then_finish() {
        let plugin = plugin_with(NullMediaEngine::instant());
        let seen = record_events(&plugin);

        let file_id = plugin.reencode_video(&request()).expect("job should schedule");
        assert_eq!(plugin.wait(&file_id), Some(JobState::Completed));

        let seen = seen.lock().unwrap();
        let progress: Vec<f64> = seen
            .iter()
            .filter_map(|e| match e {
                PluginEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(
            seen.last(),
            Some(&PluginEvent::ReencodeFinished {
                file_id: file_id.clone(),
                state: JobState::Completed,
                error: None,
            })
        );
    }

    #[test]
    fn failed_job_reports_error_and_keeps_progress_monotonic() {
        let plugin = plugin_with(FailingEngine);
        let seen = record_events(&plugin);

        let file_id = plugin.reencode_video(&request()).unwrap();
        assert_eq!(plugin.wait(&file_id), Some(JobState::Failed));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            PluginEvent::Progress {
                progress: 0.4,
                file_id: file_id.clone()
            }
        );
        match &seen[1] {
            PluginEvent::ReencodeFinished { state, error, .. } => {
                assert_eq!(*state, JobState::Failed);
                assert_eq!(error.as_deref(), Some("decoder exploded"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn invalid_request_is_not_scheduled() {
        let plugin = plugin_with(NullMediaEngine::instant());
        let mut bad = request();
        bad.bitrate = Some(10);
        let err = plugin.reencode_video(&bad).expect_err("bitrate too low");
        assert!(matches!(
            err,
            BridgeError::Reencode(ReencodeError::BitrateTooLow { .. })
        ));
        assert_eq!(plugin.job_state("job-1"), None);
    }

    #[test]
    fn observer_sees_only_its_job() {
        let plugin = plugin_with(NullMediaEngine::instant());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let other = plugin.reencode_video(&request()).unwrap();
        let observed = plugin
            .reencode_video_observed(
                &request(),
                Box::new(move |event: &PluginEvent| {
                    seen_clone.lock().unwrap().push(event.file_id().to_string());
                }),
            )
            .unwrap();
        plugin.wait_all();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|id| *id == observed));
        assert!(!seen.contains(&other));
    }

    #[test]
    fn file_ids_are_unique() {
        let plugin = plugin_with(NullMediaEngine::instant());
        let a = plugin.reencode_video(&request()).unwrap();
        let b = plugin.reencode_video(&request()).unwrap();
        assert_ne!(a, b);
        plugin.wait_all();
        assert_eq!(plugin.job_state(&a), Some(JobState::Completed));
        assert_eq!(plugin.job_state(&b), Some(JobState::Completed));
    }

    #[test]
    fn destroy_cancels_running_jobs() {
        let plugin = plugin_with(NullMediaEngine::new(200, Duration::from_millis(20)));
        let file_id = plugin.reencode_video(&request()).unwrap();
        assert!(plugin.cancel(&file_id));
        plugin.destroy();
        assert_eq!(plugin.job_state(&file_id), Some(JobState::Cancelled));
        assert!(!plugin.cancel("job-unknown"));
    }

    #[test]
    fn destroy_cancels_job_scheduled_just_before() {
        let plugin = plugin_with(NullMediaEngine::new(200, Duration::from_millis(20)));
        let file_id = plugin.reencode_video(&request()).unwrap();
        plugin.destroy();
        assert_eq!(plugin.job_state(&file_id), Some(JobState::Cancelled));
    }

    #[test]
    fn finished_jobs_leave_the_table() {
        let plugin = plugin_with(NullMediaEngine::instant());
        let mut ids = Vec::new();
        for _ in 0..(FINISHED_HISTORY + 8) {
            let file_id = plugin.reencode_video(&request()).unwrap();
            assert_eq!(plugin.wait(&file_id), Some(JobState::Completed));
            ids.push(file_id);
        }

        assert!(plugin.tracked_jobs() <= 1);
        let last = ids.last().unwrap();
        assert_eq!(plugin.job_state(last), Some(JobState::Completed));
        assert_eq!(plugin.job_state(&ids[ids.len() - 2]), Some(JobState::Completed));
        assert_eq!(plugin.job_state(&ids[0]), None);
        assert!(!plugin.cancel(&ids[0]));
    }
}
