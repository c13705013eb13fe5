use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{Connector, MqttConnector};
use crate::config::{Config, RelaySettings};
use crate::dispatch::Dispatcher;
use crate::envelope::MsgType;
use crate::logs::LogWriter;
use crate::outbound::{Outbound, DEFAULT_TELEGRAM_LEVEL};
use crate::store::{MeasurementStore, MeasurementTable, Measurements};
use crate::supervisor::{ConnectionState, Supervisor, SupervisorSettings};

/// Handle to a running relay.
///
/// Starting spawns the connection supervisor and the outbound sender on the
/// current tokio runtime and returns immediately. Every command is
/// fire-and-forget. Dropping the handle stops the supervisor.
///
/// # Panics
///
/// The constructors (`connect`, `start`, `with_connector`) panic when called
/// outside a tokio runtime. A synchronous host should build a runtime first
/// and construct the relay inside `Runtime::enter` or `block_on`.
pub struct Relay {
    run: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    store: MeasurementStore,
    outbound: Outbound,
    supervisor: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl Relay {
    /// Connect to an MQTT broker with the default settings.
    pub fn connect(address: &str, username: &str, password: &str) -> Self {
        Self::start(&Config::for_broker(address, username, password))
    }

    pub fn start(config: &Config) -> Self {
        let connector = MqttConnector::new(&config.broker, config.relay.transport_timeout());
        info!(
            host = %config.broker.host,
            port = config.broker.port,
            channel = %config.relay.channel,
            "starting relay"
        );
        Self::with_connector(connector, &config.relay)
    }

    /// Start with any broker transport.
    ///
    /// # Panics
    ///
    /// Panics if no tokio runtime is current.
    pub fn with_connector<C: Connector>(connector: C, settings: &RelaySettings) -> Self {
        let store = MeasurementStore::new();
        let logs = LogWriter::new(settings.logs_dir.clone());
        let dispatcher = Dispatcher::new(store.clone(), logs);

        let (run_tx, run_rx) = watch::channel(true);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (publisher_tx, publisher_rx) = watch::channel(None);

        let (outbound, sender) =
            Outbound::spawn(settings.outbound_queue, settings.channel.clone(), publisher_rx);

        let supervisor = Supervisor::new(
            connector,
            SupervisorSettings::from(settings),
            dispatcher,
            run_rx,
            state_tx,
            publisher_tx,
        );
        let supervisor = tokio::spawn(supervisor.run());

        Self {
            run: run_tx,
            state: state_rx,
            store,
            outbound,
            supervisor,
            sender,
        }
    }

    /// Ask the supervisor to disconnect. Does not wait.
    pub fn stop(&self) {
        self.run.send_replace(false);
    }

    /// Flush queued commands, then disconnect and wait for the supervisor
    /// to finish.
    pub async fn shutdown(self) {
        let Self {
            run,
            supervisor,
            sender,
            outbound,
            ..
        } = self;

        drop(outbound);
        if let Err(e) = sender.await {
            warn!("outbound sender task failed: {e}");
        }

        run.send_replace(false);
        if let Err(e) = supervisor.await {
            warn!("supervisor task failed: {e}");
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for watching connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    // -- measurements -------------------------------------------------------

    pub async fn all_measurements(&self) -> MeasurementTable {
        self.store.snapshot().await
    }

    pub async fn device_measurements(&self, device_id: &str) -> Option<Measurements> {
        self.store.device(device_id).await
    }

    pub async fn measurement(&self, device_id: &str, name: &str) -> Option<Value> {
        self.store.get(device_id, name).await
    }

    // -- commands -----------------------------------------------------------

    pub fn request_measurements(&self) {
        self.outbound.request_measurements();
    }

    pub fn get_logs(&self) {
        self.outbound.get_logs();
    }

    pub fn send_telegram(&self, message: &str) {
        self.send_telegram_with_level(message, DEFAULT_TELEGRAM_LEVEL);
    }

    pub fn send_telegram_with_level(&self, message: &str, level: &str) {
        self.outbound.send_telegram(message, level);
    }

    pub fn set_commands(&self, device_id: &str, commands: impl Into<Value>) {
        self.outbound.set_commands(device_id, commands);
    }

    pub fn send_message(
        &self,
        msg_type: MsgType,
        msg_id: &str,
        device_id: &str,
        command: impl Into<Value>,
    ) {
        self.outbound.send_message(msg_type, msg_id, device_id, command);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{MsgId, Reply};
    use crate::supervisor::tests::{FakeBroker, FakeConnector};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn relay_settings(logs: &std::path::Path) -> RelaySettings {
        RelaySettings {
            logs_dir: logs.to_path_buf(),
            ..RelaySettings::default()
        }
    }

    async fn connected_relay(broker: FakeBroker) -> (Relay, FakeConnector, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let connector = FakeConnector(Arc::new(Mutex::new(broker)));
        let settings = relay_settings(&tmp.path().join("logs"));
        let relay = Relay::with_connector(connector.clone(), &settings);
        relay
            .subscribe_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        (relay, connector, tmp)
    }

    /// Let queued work (dispatch, outbound) run on the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    #[should_panic]
    fn constructing_outside_a_runtime_panics() {
        let _ = Relay::with_connector(FakeConnector::default(), &RelaySettings::default());
    }

    #[test]
    fn constructing_inside_an_entered_runtime_works() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let relay = {
            let _guard = rt.enter();
            Relay::with_connector(FakeConnector::default(), &relay_settings(tmp.path()))
        };
        rt.block_on(async {
            relay
                .subscribe_state()
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .unwrap();
            relay.shutdown().await;
        });
    }

    #[tokio::test]
    async fn start_returns_before_connecting() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = FakeConnector(Arc::new(Mutex::new(FakeBroker {
            fail_connects: usize::MAX,
            ..Default::default()
        })));
        let relay = Relay::with_connector(connector, &relay_settings(tmp.path()));
        assert_ne!(relay.connection_state(), ConnectionState::Connected);
        relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_reply_is_readable_through_facade() {
        let (relay, connector, _tmp) = connected_relay(FakeBroker::default()).await;

        let reply = Reply::new(MsgId::ReportMeasurements, "all", json!({"dev1": {"temp": 22}}));
        connector.deliver(reply.encode().unwrap());
        settle().await;

        assert_eq!(relay.measurement("dev1", "temp").await, Some(json!(22)));
        assert_eq!(relay.measurement("dev1", "missing").await, None);
        assert_eq!(relay.all_measurements().await.len(), 1);
        assert_eq!(relay.device_measurements("dev1").await.unwrap().len(), 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn log_reply_lands_in_logs_dir() {
        let (relay, connector, tmp) = connected_relay(FakeBroker::default()).await;

        let reply = Reply::new(MsgId::GetLogs, "", "path/to/file.log\nline1\nline2");
        connector.deliver(reply.encode().unwrap());

        let target = tmp.path().join("logs").join("file.log");
        for _ in 0..200 {
            if target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        relay.shutdown().await;

        assert_eq!(std::fs::read_to_string(target).unwrap(), "line1\nline2");
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_published_on_the_channel() {
        let (relay, connector, _tmp) = connected_relay(FakeBroker::default()).await;

        relay.get_logs();
        relay.send_telegram("hello");
        relay.send_telegram_with_level("disk full", "ERROR");
        relay.set_commands("dev-1", json!({"led": true}));
        relay.send_message(MsgType::Request, "custom", "dev-2", "x");
        relay.shutdown().await;

        let b = connector.broker();
        // Initial broadcast plus five commands.
        let ids: Vec<&str> = b
            .published
            .iter()
            .map(|(_, v)| v["msg_id"].as_str().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                "reportMeasurements",
                "getLogs",
                "sendTelegram",
                "sendTelegram",
                "setCommands",
                "custom"
            ]
        );
        assert_eq!(b.published[2].1["command"], "INFO");
        assert_eq!(b.published[3].1["device_id"], "disk full");
        assert_eq!(b.published[3].1["command"], "ERROR");
        assert!(b.published.iter().all(|(ch, _)| ch == "nats_dialog"));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_while_disconnected_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = FakeConnector(Arc::new(Mutex::new(FakeBroker {
            fail_connects: usize::MAX,
            ..Default::default()
        })));
        let relay = Relay::with_connector(connector.clone(), &relay_settings(tmp.path()));

        relay.get_logs();
        relay.request_measurements();
        settle().await;
        relay.shutdown().await;

        assert!(connector.broker().published.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disconnects_and_swallows_errors() {
        let (relay, connector, _tmp) = connected_relay(FakeBroker {
            fail_disconnect: true,
            ..Default::default()
        })
        .await;

        let mut state = relay.subscribe_state();
        relay.stop();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(connector.broker().disconnects, 1);
        relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_relay_stops_supervisor() {
        let (relay, connector, _tmp) = connected_relay(FakeBroker::default()).await;
        let mut state = relay.subscribe_state();
        drop(relay);

        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(connector.broker().disconnects, 1);
    }
}
