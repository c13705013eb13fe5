//! Telemetry relay: keeps a supervised broker connection to a fleet of
//! devices, caches the measurements they report, saves the log dumps they
//! send, and forwards commands to them.

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod logs;
pub mod outbound;
pub mod relay;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use relay::Relay;
pub use store::{MeasurementStore, MeasurementTable, Measurements};
pub use supervisor::ConnectionState;
