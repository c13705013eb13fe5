//! Stateful device fleet simulator for local development.
//!
//! Every device carries a few metrics that evolve as a random walk with
//! mean reversion, so consecutive reports look like a real sensor rather
//! than white noise. Each device also keeps a short ring of log lines that
//! `getLogs` dumps.

use serde_json::{Map, Value};
use std::collections::VecDeque;

use telemetry_relay::envelope::timestamp_now;

/// Log lines kept per device.
const LOG_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Shape of one simulated metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub name: &'static str,
    pub center: f64,
    pub walk_sigma: f64,
    pub mean_reversion: f64,
    pub min: f64,
    pub max: f64,
    /// Decimal places kept in reports.
    pub precision: i32,
}

pub const METRICS: [MetricSpec; 3] = [
    MetricSpec {
        name: "temperature",
        center: 22.0,
        walk_sigma: 0.3,
        mean_reversion: 0.05,
        min: -20.0,
        max: 60.0,
        precision: 1,
    },
    MetricSpec {
        name: "humidity",
        center: 45.0,
        walk_sigma: 1.0,
        mean_reversion: 0.05,
        min: 0.0,
        max: 100.0,
        precision: 1,
    },
    MetricSpec {
        name: "voltage",
        center: 12.0,
        walk_sigma: 0.05,
        mean_reversion: 0.1,
        min: 10.5,
        max: 14.4,
        precision: 2,
    },
];

impl MetricSpec {
    fn step(&self, current: f64) -> f64 {
        let pull = self.mean_reversion * (self.center - current);
        let walk = self.walk_sigma * approx_std_normal();
        (current + pull + walk).clamp(self.min, self.max)
    }

    fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.precision);
        (value * scale).round() / scale
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

struct Device {
    id: String,
    values: Vec<f64>,
    log: VecDeque<String>,
}

impl Device {
    fn new(id: &str) -> Self {
        // Start each device a little off-centre so they diverge.
        let values = METRICS
            .iter()
            .map(|m| (m.center + 5.0 * m.walk_sigma * approx_std_normal()).clamp(m.min, m.max))
            .collect();
        let mut device = Self {
            id: id.to_string(),
            values,
            log: VecDeque::new(),
        };
        device.record("device booted");
        device
    }

    fn record(&mut self, line: impl AsRef<str>) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log
            .push_back(format!("{} {}", timestamp_now(), line.as_ref()));
    }

    fn sample(&mut self) -> Map<String, Value> {
        let mut out = Map::new();
        for (spec, value) in METRICS.iter().zip(self.values.iter_mut()) {
            *value = spec.step(*value);
            out.insert(spec.name.to_string(), Value::from(spec.round(*value)));
        }
        out
    }
}

/// A fleet of simulated devices, addressed by id.
pub struct FleetSim {
    devices: Vec<Device>,
}

impl FleetSim {
    pub fn new<S: AsRef<str>>(ids: &[S]) -> Self {
        Self {
            devices: ids.iter().map(|id| Device::new(id.as_ref())).collect(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Advance every device one tick and return the fleet-wide report
    /// payload: `{ "<device>": { "<metric>": <value>, ... }, ... }`.
    pub fn report(&mut self) -> Value {
        let mut payload = Map::new();
        for device in &mut self.devices {
            let sample = device.sample();
            device.record("measurements reported");
            payload.insert(device.id.clone(), Value::Object(sample));
        }
        Value::Object(payload)
    }

    /// One log dump per device. The first line is the file path the relay
    /// names its copy after.
    pub fn log_dumps(&self) -> Vec<(String, String)> {
        self.devices
            .iter()
            .map(|d| {
                let mut dump = format!("/var/log/{}.log", d.id);
                for line in &d.log {
                    dump.push('\n');
                    dump.push_str(line);
                }
                (d.id.clone(), dump)
            })
            .collect()
    }

    /// Note a command in the log of `device_id`, or of every device for
    /// `"all"`. Returns how many devices took it.
    pub fn apply_commands(&mut self, device_id: &str, commands: &Value) -> usize {
        let mut applied = 0;
        for device in &mut self.devices {
            if device_id == telemetry_relay::envelope::ALL_DEVICES || device.id == device_id {
                device.record(format!("commands received: {commands}"));
                applied += 1;
            }
        }
        applied
    }
}

// ===========================================================================
// Tests
// ===========================================================================
