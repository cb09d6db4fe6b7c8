//! Component A: logger / event bus (§4.A).
//!
//! Every `tracing` call in the gateway goes through here first rather than
//! hitting `tracing::info!` et al. directly, so the admin API's ring
//! buffer and SSE stream stay in lock-step with the process-wide log —
//! one call site, two sinks, the same shape the teacher's `Metrics`
//! module uses for its single `install()` entry point.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

const RING_CAPACITY: usize = 200;
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn parse(s: &str) -> Level {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp_ms: i64,
    pub level: Level,
    pub tag: String,
    pub message: String,
}

struct Inner {
    ring: std::sync::Mutex<VecDeque<LogRecord>>,
    min_level: Level,
    tx: broadcast::Sender<LogRecord>,
}

/// Bounded ring buffer + topic-keyed pub/sub over structured log records.
/// Cheap to clone (an `Arc` internally), handed out from `GatewayState`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(log_level: &str) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ring: std::sync::Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                min_level: Level::parse(log_level),
                tx,
            }),
        }
    }

    /// Records a structured log entry: pushes it onto the ring (evicting
    /// the oldest entry past `RING_CAPACITY`), publishes it to any live
    /// SSE subscribers, and emits the matching `tracing` event so the
    /// process-wide JSON log sees it too. A subscriber that has dropped
    /// its receiver (no one listening) is not an error — `send` returning
    /// `Err` here is expected and ignored, never propagated.
    pub fn log(&self, level: Level, tag: &str, message: impl Into<String>) {
        let message = message.into();
        if level < self.inner.min_level {
            return;
        }
        let record = LogRecord {
            timestamp_ms: now_ms(),
            level,
            tag: tag.to_string(),
            message: message.clone(),
        };

        match level {
            Level::Debug => tracing::debug!(tag, "{}", message),
            Level::Info => tracing::info!(tag, "{}", message),
            Level::Warn => tracing::warn!(tag, "{}", message),
            Level::Error => tracing::error!(tag, "{}", message),
        }

        {
            let mut ring = self.inner.ring.lock().unwrap();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        let _ = self.inner.tx.send(record);
    }

    pub fn debug(&self, tag: &str, message: impl Into<String>) {
        self.log(Level::Debug, tag, message);
    }
    pub fn info(&self, tag: &str, message: impl Into<String>) {
        self.log(Level::Info, tag, message);
    }
    pub fn warn(&self, tag: &str, message: impl Into<String>) {
        self.log(Level::Warn, tag, message);
    }
    pub fn error(&self, tag: &str, message: impl Into<String>) {
        self.log(Level::Error, tag, message);
    }

    /// Snapshot of the ring buffer, oldest first — backs `GET
    /// /api/logs/recent` and the replay phase of the SSE stream.
    pub fn recent(&self) -> Vec<LogRecord> {
        self.inner.ring.lock().unwrap().iter().cloned().collect()
    }

    /// Last `n` entries, oldest first — backs the SSE stream's replay
    /// phase (`GET /api/logs` replays the last 30, per §4.H).
    pub fn recent_n(&self, n: usize) -> Vec<LogRecord> {
        let ring = self.inner.ring.lock().unwrap();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// A fresh subscription for the live tail of `GET /api/logs`. Each
    /// call returns an independent receiver; the sender is a broadcast
    /// channel so a slow subscriber lagging past `BROADCAST_CAPACITY`
    /// only loses its own backlog, it never blocks `log()` callers.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.inner.tx.subscribe()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let bus = EventBus::new("debug");
        for i in 0..(RING_CAPACITY + 10) {
            bus.info("test", format!("entry {i}"));
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), RING_CAPACITY);
        assert_eq!(recent[0].message, "entry 10");
    }

    #[test]
    fn min_level_filters_quieter_records() {
        let bus = EventBus::new("warn");
        bus.info("test", "should be dropped");
        bus.error("test", "should be kept");
        let recent = bus.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "should be kept");
    }

    #[tokio::test]
    async fn subscriber_receives_live_events() {
        let bus = EventBus::new("debug");
        let mut rx = bus.subscribe();
        bus.info("request", "hello");
        let record = rx.recv().await.unwrap();
        assert_eq!(record.tag, "request");
        assert_eq!(record.message, "hello");
    }

    #[test]
    fn lagging_subscriber_does_not_panic_log_calls() {
        let bus = EventBus::new("debug");
        let _rx = bus.subscribe();
        for i in 0..(BROADCAST_CAPACITY + 50) {
            bus.info("flood", format!("{i}"));
        }
    }
}
