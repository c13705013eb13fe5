//! Routes inbound envelopes to the measurement store or the log writer.
//!
//! Correlation is by kind only: a `reportMeasurements` reply for `all`
//! updates the store, any `getLogs` reply is persisted, everything else
//! (including the relay's own requests echoed back on the shared channel)
//! is ignored.

use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

use crate::envelope::{DecodeError, Inbound, MsgId, ALL_DEVICES};
use crate::logs::{LogWriteError, LogWriter};
use crate::store::MeasurementStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Measurements { devices: usize },
    Log { path: PathBuf },
    Ignored,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    Malformed(#[from] DecodeError),
    #[error("getLogs reply payload is not a string")]
    LogPayloadNotText,
    #[error(transparent)]
    LogWrite(#[from] LogWriteError),
}

/// What an envelope should be routed to, decided from its header alone.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Measurements,
    Logs,
    Ignore,
}

fn route(msg: &Inbound) -> Route {
    if !msg.is_reply() {
        return Route::Ignore;
    }
    if msg.is(MsgId::ReportMeasurements) && msg.device_id == ALL_DEVICES && msg.payload.is_object()
    {
        return Route::Measurements;
    }
    if msg.is(MsgId::GetLogs) {
        return Route::Logs;
    }
    Route::Ignore
}

#[derive(Clone)]
pub struct Dispatcher {
    store: MeasurementStore,
    logs: LogWriter,
}

impl Dispatcher {
    pub fn new(store: MeasurementStore, logs: LogWriter) -> Self {
        Self { store, logs }
    }

    pub async fn dispatch(&self, raw: &[u8]) -> Result<Dispatched, DispatchError> {
        let msg = Inbound::decode(raw)?;

        match route(&msg) {
            Route::Measurements => {
                let Value::Object(report) = &msg.payload else {
                    return Ok(Dispatched::Ignored);
                };
                let devices = self.store.merge_report(report).await;
                Ok(Dispatched::Measurements { devices })
            }
            Route::Logs => {
                let Value::String(content) = &msg.payload else {
                    return Err(DispatchError::LogPayloadNotText);
                };
                let path = self.logs.write(content).await?;
                Ok(Dispatched::Log { path })
            }
            Route::Ignore => Ok(Dispatched::Ignored),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
