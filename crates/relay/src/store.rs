use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

// ---------------------------------------------------------------------------
// Public type aliases
// ---------------------------------------------------------------------------

/// measurement name -> latest value
pub type Measurements = HashMap<String, Value>;

/// device id -> measurements
pub type MeasurementTable = HashMap<String, Measurements>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Latest measurement values per device.
///
/// Cloning is cheap and every clone sees the same table. The dispatcher is
/// the only writer; readers always receive copies, never a reference into
/// the locked table. Entries are created on first report and never removed.
#[derive(Clone, Default)]
pub struct MeasurementStore {
    table: Arc<RwLock<MeasurementTable>>,
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `measurements` into the device's entry, creating it if new.
    /// Existing names are overwritten; names not mentioned are kept.
    pub async fn update(&self, device_id: &str, measurements: Map<String, Value>) {
        let mut table = self.table.write().await;
        table
            .entry(device_id.to_string())
            .or_default()
            .extend(measurements);
    }

    /// Merge a fleet-wide report (`{device_id: {name: value}}`) under a single
    /// write lock. Device entries that are not objects are skipped. Returns
    /// the number of devices merged.
    pub async fn merge_report(&self, report: &Map<String, Value>) -> usize {
        let mut table = self.table.write().await;
        let mut merged = 0;

        for (device_id, measurements) in report {
            let Value::Object(measurements) = measurements else {
                warn!(device = %device_id, "measurement report entry is not an object, skipping");
                continue;
            };
            let entry = table.entry(device_id.clone()).or_default();
            for (name, value) in measurements {
                entry.insert(name.clone(), value.clone());
            }
            merged += 1;
        }

        merged
    }

    /// Copy of the whole table.
    pub async fn snapshot(&self) -> MeasurementTable {
        self.table.read().await.clone()
    }

    /// Copy of one device's measurements.
    pub async fn device(&self, device_id: &str) -> Option<Measurements> {
        self.table.read().await.get(device_id).cloned()
    }

    pub async fn get(&self, device_id: &str, name: &str) -> Option<Value> {
        self.table
            .read()
            .await
            .get(device_id)
            .and_then(|m| m.get(name))
            .cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.table.read().await.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
