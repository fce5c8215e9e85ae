use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Frame types on the log-stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Log,
    Error,
    Info,
    Connected,
    Disconnected,
}

/// One typed frame, shared between the live ring buffer and the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogFrame {
    pub fn log(pod: &str, message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Log,
            pod: Some(pod.to_owned()),
            container: Some("builder".into()),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Info,
            pod: None,
            container: None,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            pod: None,
            container: None,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Bounded scrollback plus a broadcast fan-out for live tails. Writers never
/// block on slow readers; a lagged subscriber just loses frames and keeps
/// reading from wherever the stream is now.
pub struct LogBuffer {
    ring: Mutex<VecDeque<LogFrame>>,
    capacity: usize,
    tx: broadcast::Sender<LogFrame>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    pub fn push(&self, frame: LogFrame) {
        {
            let mut ring = self.ring.lock().expect("log ring poisoned");
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(frame.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(frame);
    }

    /// Current scrollback, oldest first.
    pub fn snapshot(&self) -> Vec<LogFrame> {
        self.ring
            .lock()
            .expect("log ring poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogFrame> {
        self.tx.subscribe()
    }

    /// Render the scrollback as plain text for persistence.
    pub fn render_text(&self) -> String {
        let ring = self.ring.lock().expect("log ring poisoned");
        let mut out = String::new();
        for frame in ring.iter() {
            out.push_str(&format!(
                "{} {}\n",
                frame.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                frame.message
            ));
        }
        out
    }
}

/// Per-release live buffers. Entries exist only while a build is in flight;
/// historical logs come from object storage.
#[derive(Clone, Default)]
pub struct LogBufferRegistry {
    buffers: Arc<DashMap<Uuid, Arc<LogBuffer>>>,
}

impl LogBufferRegistry {
    pub const DEFAULT_CAPACITY: usize = 2048;

    pub fn create(&self, release_id: Uuid) -> Arc<LogBuffer> {
        let buf = Arc::new(LogBuffer::new(Self::DEFAULT_CAPACITY));
        self.buffers.insert(release_id, buf.clone());
        buf
    }

    pub fn get(&self, release_id: Uuid) -> Option<Arc<LogBuffer>> {
        self.buffers.get(&release_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, release_id: Uuid) {
        self.buffers.remove(&release_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(LogFrame::log("pod", format!("line {i}")));
        }
        let frames = buf.snapshot();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].message, "line 2");
        assert_eq!(frames[2].message, "line 4");
    }

    #[tokio::test]
    async fn subscriber_receives_pushed_frames() {
        let buf = LogBuffer::new(8);
        let mut rx = buf.subscribe();
        buf.push(LogFrame::info("starting"));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Info);
        assert_eq!(frame.message, "starting");
    }

    #[test]
    fn frame_serializes_with_type_tag() {
        let frame = LogFrame::log("builder-abc", "hello");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["pod"], "builder-abc");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn info_frame_omits_pod() {
        let json = serde_json::to_value(LogFrame::info("x")).unwrap();
        assert!(json.get("pod").is_none());
    }

    #[test]
    fn registry_lifecycle() {
        let registry = LogBufferRegistry::default();
        let id = Uuid::new_v4();
        assert!(registry.get(id).is_none());

        let buf = registry.create(id);
        buf.push(LogFrame::info("x"));
        assert_eq!(registry.get(id).unwrap().snapshot().len(), 1);

        registry.remove(id);
        assert!(registry.get(id).is_none());
    }
}
