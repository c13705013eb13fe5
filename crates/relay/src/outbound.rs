//! Fire-and-forget outbound requests.
//!
//! Callers enqueue onto a bounded queue and return immediately. One sender
//! task drains it and publishes through whatever session is live at that
//! moment. Nothing is retried: a full queue, a missing connection, or a
//! failed publish drops the request with a warning.

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::Publisher;
use crate::envelope::{MsgId, MsgType, Request, ALL_DEVICES};

/// Level used by `send_telegram` when the caller has no preference.
pub const DEFAULT_TELEGRAM_LEVEL: &str = "INFO";

#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Request>,
}

impl Outbound {
    /// Create the queue and spawn its sender task. The task ends once every
    /// `Outbound` clone has been dropped and the queue is drained.
    pub fn spawn<P: Publisher>(
        capacity: usize,
        channel: String,
        publisher: watch::Receiver<Option<P>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(run_sender(rx, channel, publisher));
        (Self { tx }, task)
    }

    /// Enqueue a request without waiting. Returns whether it was queued.
    pub fn send(&self, request: Request) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!(msg_id = %req.msg_id, "outbound queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                warn!(msg_id = %req.msg_id, "outbound sender stopped, dropping request");
                false
            }
        }
    }

    pub fn send_message(
        &self,
        msg_type: MsgType,
        msg_id: &str,
        device_id: &str,
        command: impl Into<Value>,
    ) -> bool {
        self.send(Request::new(msg_type, msg_id, device_id, command))
    }

    pub fn request_measurements(&self) -> bool {
        self.send(Request::report_measurements())
    }

    pub fn get_logs(&self) -> bool {
        self.send_message(MsgType::Request, MsgId::GetLogs.as_str(), "", "")
    }

    /// The telegram text travels in `device_id` and the level in `command`;
    /// that is the layout the receiving peer reads.
    pub fn send_telegram(&self, message: &str, level: &str) -> bool {
        self.send_message(MsgType::Request, MsgId::SendTelegram.as_str(), message, level)
    }

    pub fn set_commands(&self, device_id: &str, commands: impl Into<Value>) -> bool {
        self.send_message(
            MsgType::Request,
            MsgId::SetCommands.as_str(),
            device_id,
            commands,
        )
    }

    /// Broadcast variant of [`Self::set_commands`].
    pub fn set_commands_all(&self, commands: impl Into<Value>) -> bool {
        self.set_commands(ALL_DEVICES, commands)
    }
}

async fn run_sender<P: Publisher>(
    mut rx: mpsc::Receiver<Request>,
    channel: String,
    publisher: watch::Receiver<Option<P>>,
) {
    while let Some(request) = rx.recv().await {
        // Clone out of the watch so the borrow is not held across the await.
        let Some(live) = publisher.borrow().clone() else {
            warn!(msg_id = %request.msg_id, "not connected, dropping request");
            continue;
        };

        let payload = match request.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(msg_id = %request.msg_id, "failed to encode request: {e}");
                continue;
            }
        };

        match live.publish(&channel, payload).await {
            Ok(()) => debug!(
                msg_id = %request.msg_id,
                device = %request.device_id,
                "request published"
            ),
            Err(e) => warn!(msg_id = %request.msg_id, "error sending message: {e}"),
        }
    }
    debug!("outbound sender stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        sent: Arc<Mutex<Vec<(String, Value)>>>,
        fail: bool,
    }

    impl Publisher for RecordingPublisher {
        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::Closed);
            }
            let v: Value = serde_json::from_slice(&payload).unwrap();
            self.sent.lock().unwrap().push((channel.to_string(), v));
            Ok(())
        }
    }

    /// Drop the facade and wait for the sender to drain the queue.
    async fn drain(outbound: Outbound, task: JoinHandle<()>) {
        drop(outbound);
        task.await.unwrap();
    }

    /// A receiver pinned to `p`; watch receivers keep the last value after
    /// the sender is gone.
    fn connected(p: &RecordingPublisher) -> watch::Receiver<Option<RecordingPublisher>> {
        watch::channel(Some(p.clone())).1
    }

    #[tokio::test]
    async fn commands_publish_expected_envelopes() {
        let publisher = RecordingPublisher::default();
        let (out, task) = Outbound::spawn(16, "chan".into(), connected(&publisher));

        assert!(out.get_logs());
        assert!(out.send_telegram("pump failed", DEFAULT_TELEGRAM_LEVEL));
        assert!(out.set_commands("dev-3", json!({"valve": "open"})));
        assert!(out.request_measurements());
        drain(out, task).await;

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|(ch, _)| ch == "chan"));

        let logs = &sent[0].1;
        assert_eq!(logs["msg_type"], "request");
        assert_eq!(logs["msg_id"], "getLogs");
        assert_eq!(logs["device_id"], "");
        assert_eq!(logs["command"], "");

        let telegram = &sent[1].1;
        assert_eq!(telegram["msg_id"], "sendTelegram");
        assert_eq!(telegram["device_id"], "pump failed");
        assert_eq!(telegram["command"], "INFO");

        let commands = &sent[2].1;
        assert_eq!(commands["msg_id"], "setCommands");
        assert_eq!(commands["device_id"], "dev-3");
        assert_eq!(commands["command"], json!({"valve": "open"}));

        let report = &sent[3].1;
        assert_eq!(report["msg_id"], "reportMeasurements");
        assert_eq!(report["device_id"], "all");
        assert_eq!(report["command"], "1");
    }

    #[tokio::test]
    async fn set_commands_all_broadcasts() {
        let publisher = RecordingPublisher::default();
        let (out, task) = Outbound::spawn(4, "chan".into(), connected(&publisher));
        out.set_commands_all("reboot");
        drain(out, task).await;

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent[0].1["device_id"], "all");
        assert_eq!(sent[0].1["command"], "reboot");
    }

    #[tokio::test]
    async fn requests_dropped_while_disconnected() {
        let publisher = RecordingPublisher::default();
        let (tx, rx) = watch::channel::<Option<RecordingPublisher>>(None);
        let (out, task) = Outbound::spawn(4, "chan".into(), rx);

        // Queued fine; dropped by the sender because nothing is live.
        assert!(out.get_logs());
        drain(out, task).await;

        assert!(publisher.sent.lock().unwrap().is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let publisher = RecordingPublisher {
            fail: true,
            ..Default::default()
        };
        let (out, task) = Outbound::spawn(4, "chan".into(), connected(&publisher));
        assert!(out.get_logs());
        assert!(out.get_logs());
        drain(out, task).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_without_blocking() {
        let publisher = RecordingPublisher::default();
        let (out, task) = Outbound::spawn(2, "chan".into(), connected(&publisher));

        // The sender task has not run yet on this single thread, so the
        // queue fills up after two requests.
        assert!(out.get_logs());
        assert!(out.get_logs());
        assert!(!out.get_logs());
        drain(out, task).await;

        assert_eq!(publisher.sent.lock().unwrap().len(), 2);
    }
}
