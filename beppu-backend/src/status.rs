use beppu_types::{UploadPhase, UploadStatusEvent};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Events buffered per session before a slow subscriber starts losing the
/// oldest ones. An upload emits at most one event per phase, so this only
/// matters for pathological subscribers; the drop policy keeps the newest
/// events and therefore the terminal one.
const CHANNEL_CAPACITY: usize = 64;

struct Channel {
    tx: broadcast::Sender<UploadStatusEvent>,
    last_activity: Instant,
}

/// Single-writer/multi-reader live status feed, one channel per upload
/// session. Publication is fire-and-forget: a missing or slow subscriber
/// never blocks the upload processor.
pub struct StatusBoard {
    channels: RwLock<HashMap<String, Channel>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Attach to a session's feed. Each subscriber receives every event
    /// published after its own attachment, independently of other
    /// subscribers.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<UploadStatusEvent> {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let channel = channels
            .entry(session_id.to_string())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                last_activity: Instant::now(),
            });

        channel.tx.subscribe()
    }

    /// Publish one event to the session's feed. Delivering a terminal
    /// event closes the channel: the sender is dropped, subscribers drain
    /// whatever is buffered and then see the stream end.
    pub fn publish(&self, event: UploadStatusEvent) {
        let terminal = event.upload_status.is_terminal();
        let session_id = event.chunk_id.clone();

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let channel = channels
            .entry(session_id.clone())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                last_activity: Instant::now(),
            });

        channel.last_activity = Instant::now();
        // Fire-and-forget; an Err only means nobody is listening right now
        let _ = channel.tx.send(event);

        if terminal {
            channels.remove(&session_id);
        }
    }

    /// Build an event in the wire shape clients consume.
    pub fn event(
        session_id: &str,
        phase: UploadPhase,
        file_id: Option<&str>,
        error: Option<&str>,
    ) -> UploadStatusEvent {
        UploadStatusEvent {
            event: "upload_status".to_string(),
            chunk_id: session_id.to_string(),
            file_id: file_id.unwrap_or_default().to_string(),
            error_message: error.unwrap_or_default().to_string(),
            upload_status: phase,
        }
    }

    /// Drop channels that have had no subscriber and no publication for
    /// longer than `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let before = channels.len();
        channels.retain(|_, channel| {
            channel.tx.receiver_count() > 0 || channel.last_activity.elapsed() < max_idle
        });
        before - channels.len()
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
