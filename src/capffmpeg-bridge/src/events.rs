//! Events pushed to the host outside of any call, and the listener registry
//! that fans them out.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Lifecycle of a re-encode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    Progress {
        progress: f64,
        file_id: String,
    },
    ReencodeFinished {
        file_id: String,
        state: JobState,
        error: Option<String>,
    },
}

impl PluginEvent {
    pub const PROGRESS: &'static str = "progress";
    pub const REENCODE_FINISHED: &'static str = "reencodeFinished";

    pub fn name(&self) -> &'static str {
        match self {
            PluginEvent::Progress { .. } => Self::PROGRESS,
            PluginEvent::ReencodeFinished { .. } => Self::REENCODE_FINISHED,
        }
    }

    /// Payload in the shape the host's listeners expect.
    pub fn data(&self) -> Value {
        match self {
            PluginEvent::Progress { progress, file_id } => json!({
                "progress": progress,
                "fileId": file_id,
            }),
            PluginEvent::ReencodeFinished {
                file_id,
                state,
                error,
            } => {
                let mut data = json!({
                    "fileId": file_id,
                    "state": state.as_str(),
                });
                if let Some(error) = error {
                    data["error"] = Value::String(error.clone());
                }
                data
            }
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            PluginEvent::Progress { file_id, .. } | PluginEvent::ReencodeFinished { file_id, .. } => {
                file_id
            }
        }
    }
}

pub type Listener = Box<dyn Fn(&PluginEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type SharedListener = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Registered listeners, notified in registration order.
///
/// Listeners may add or remove listeners while being notified; changes take
/// effect from the next event.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, SharedListener)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().unwrap().push((id, Arc::from(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap();
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &PluginEvent) {
        let snapshot: Vec<SharedListener> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        tracing::trace!(event = event.name(), listeners = snapshot.len(), "Emitting event");
        for listener in snapshot {
            listener(event);
        }
    }
}
