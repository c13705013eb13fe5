//! Broker connection lifecycle.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──▶ Connecting ──[ok]──▶ Connected ──[stop]──▶ Disconnecting ──▶ Disconnected
//!                   ▲      │                 │
//!                   │ [fail/timeout]   [session lost]
//!                   │      ▼                 ▼
//!                   └── backoff ◀──── Disconnected
//! ```
//!
//! A lost session reports `Disconnected` while it backs off; a failed
//! attempt keeps showing `Connecting` with its attempt number.
//!
//! Connect-phase failures (timeout, refused, subscribe rejected, initial
//! request not sent) and lost sessions are retried forever with a fixed
//! backoff. A failed disconnect is logged and dropped. Nothing here ever
//! returns an error to whoever spawned the supervisor.

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Connector, Publisher, Session};
use crate::config::RelaySettings;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::envelope::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `attempt` counts from 1 and resets after every successful connect.
    Connecting { attempt: u32 },
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Timing and addressing the supervisor needs, split from the full config.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub channel: String,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
}

impl From<&RelaySettings> for SupervisorSettings {
    fn from(r: &RelaySettings) -> Self {
        Self {
            channel: r.channel.clone(),
            connect_timeout: r.connect_timeout(),
            retry_interval: r.retry_interval(),
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    Stopped,
    Lost(BrokerError),
}

type PublisherOf<C> = <<C as Connector>::Session as Session>::Publisher;

pub struct Supervisor<C: Connector> {
    connector: C,
    settings: SupervisorSettings,
    dispatcher: Dispatcher,
    /// Run State Flag: `true` while the relay should stay connected.
    run: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    publisher: watch::Sender<Option<PublisherOf<C>>>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        settings: SupervisorSettings,
        dispatcher: Dispatcher,
        run: watch::Receiver<bool>,
        state: watch::Sender<ConnectionState>,
        publisher: watch::Sender<Option<PublisherOf<C>>>,
    ) -> Self {
        Self {
            connector,
            settings,
            dispatcher,
            run,
            state,
            publisher,
        }
    }

    /// Run until the run flag is cleared (or its sender dropped).
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        while self.keep_running() {
            attempt += 1;
            self.set_state(ConnectionState::Connecting { attempt });

            let established = tokio::select! {
                _ = stop_requested(&mut self.run) => break,
                r = establish(&self.connector, &self.settings) => r,
            };

            match established {
                Ok(session) => {
                    info!(channel = %self.settings.channel, "successfully connected to broker");
                    attempt = 0;
                    match self.serve(session).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(e) => {
                            warn!(
                                retry_in = ?self.settings.retry_interval,
                                "broker connection lost: {e}"
                            );
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(e) => warn!(
                    attempt,
                    retry_in = ?self.settings.retry_interval,
                    "error connecting to broker: {e}"
                ),
            }

            if !self.backoff().await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("supervisor stopped");
    }

    fn keep_running(&self) -> bool {
        *self.run.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(%state, "connection state");
        self.state.send_replace(state);
    }

    /// Pump inbound messages into the dispatcher until stop or session loss.
    async fn serve(&mut self, mut session: C::Session) -> SessionEnd {
        self.publisher.send_replace(Some(session.publisher()));
        self.set_state(ConnectionState::Connected);

        let end = loop {
            let inbound = tokio::select! {
                _ = stop_requested(&mut self.run) => break SessionEnd::Stopped,
                msg = session.next_message() => msg,
            };

            match inbound {
                Ok(raw) => self.handle_message(&raw).await,
                Err(e) => break SessionEnd::Lost(e),
            }
        };

        self.publisher.send_replace(None);

        if let SessionEnd::Stopped = end {
            self.set_state(ConnectionState::Disconnecting);
            match session.disconnect().await {
                Ok(()) => info!("disconnected from broker"),
                Err(e) => error!("error disconnecting from broker: {e}"),
            }
        }

        end
    }

    async fn handle_message(&self, raw: &[u8]) {
        match self.dispatcher.dispatch(raw).await {
            Ok(Dispatched::Measurements { devices }) => {
                debug!(devices, "measurements updated");
            }
            Ok(Dispatched::Log { path }) => {
                info!(path = %path.display(), "log file saved");
            }
            Ok(Dispatched::Ignored) => {}
            Err(e) => warn!("error processing message: {e}"),
        }
    }

    /// Sleep for the retry interval. Returns `false` if stop was requested
    /// meanwhile.
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            _ = stop_requested(&mut self.run) => false,
            _ = tokio::time::sleep(self.settings.retry_interval) => true,
        }
    }
}

/// Connect, subscribe, and send the initial measurement broadcast. Each step
/// is bounded by the connect timeout.
async fn establish<C: Connector>(
    connector: &C,
    settings: &SupervisorSettings,
) -> Result<C::Session, BrokerError> {
    let limit = settings.connect_timeout;

    let mut session = bounded(limit, connector.connect()).await?;
    bounded(limit, session.subscribe(&settings.channel)).await?;

    let initial = Request::report_measurements().encode()?;
    bounded(limit, session.publisher().publish(&settings.channel, initial)).await?;

    Ok(session)
}

async fn bounded<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, BrokerError>>,
) -> Result<T, BrokerError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BrokerError::Timeout(limit))?
}

/// Resolves once the run flag is `false` or its sender is gone.
async fn stop_requested(run: &mut watch::Receiver<bool>) {
    let _ = run.wait_for(|keep| !*keep).await;
}

// ===========================================================================
// Tests
// ===========================================================================
