pub mod window;

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::config::{DriftCondition, DriftConditions};
use crate::types::{Alert, AlertKind, SensorReading, TIMESTAMP_FORMAT};

pub use window::RollingWindow;

/// At most one drift alert and one rate-of-change alert per reading
pub type Alerts = SmallVec<[Alert; 2]>;

/// Rolling-window drift detection.
///
/// Keeps one bounded window per configured sensor and evaluates two rules on
/// every reading once that window is full:
///
/// - deviation: `|value| > deviation_factor * mean(window)`
/// - rate of change: `|latest - previous| > rate_of_change`
///
/// Sensors without drift conditions are ignored. The detector owns all of its
/// state; separate pipelines use separate detectors.
#[derive(Debug, Default)]
pub struct DriftDetector {
    windows: HashMap<String, RollingWindow>,
}

impl DriftDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, reading: &SensorReading, conditions: &DriftConditions) -> Alerts {
        let mut alerts = Alerts::new();

        let Some(condition) = conditions.get(&reading.sensor_name) else {
            return alerts;
        };

        let window = self
            .windows
            .entry(reading.sensor_name.clone())
            .or_insert_with(|| RollingWindow::new(condition.window_size));
        window.push(reading.value);

        // cold start
        if window.len() < condition.window_size {
            return alerts;
        }

        if let Some(alert) = check_deviation(reading, window, condition) {
            alerts.push(alert);
        }
        if let Some(alert) = check_rate_of_change(reading, window, condition) {
            alerts.push(alert);
        }

        for alert in &alerts {
            tracing::warn!(sensor = %alert.sensor, kind = %alert.kind, value = alert.value, "Anomaly detected");
        }

        alerts
    }

    /// Evaluate a batch of readings in order
    pub fn evaluate_all<'a, I>(&mut self, readings: I, conditions: &DriftConditions) -> Vec<Alert>
    where
        I: IntoIterator<Item = &'a SensorReading>,
    {
        readings
            .into_iter()
            .flat_map(|r| self.evaluate(r, conditions))
            .collect()
    }

    /// Number of values currently held for a sensor
    pub fn window_len(&self, sensor: &str) -> usize {
        self.windows.get(sensor).map_or(0, RollingWindow::len)
    }

    pub fn window(&self, sensor: &str) -> Option<&RollingWindow> {
        self.windows.get(sensor)
    }

    pub fn tracked_sensors(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }
}

fn check_deviation(reading: &SensorReading, window: &RollingWindow, condition: &DriftCondition) -> Option<Alert> {
    let rolling_avg = window.mean()?;
    // Compares the raw magnitude, not |value - avg|. Kept as-is, see DESIGN.md.
    if reading.value.abs() > condition.deviation_factor * rolling_avg {
        Some(Alert {
            timestamp: reading.timestamp,
            sensor: reading.sensor_name.clone(),
            kind: AlertKind::Drift,
            value: reading.value,
            message: format!(
                "{} - WARNING: {} sensor drift detected! (Value: {}, Avg: {})",
                reading.timestamp.format(TIMESTAMP_FORMAT),
                reading.sensor_name,
                Repr(reading.value),
                Repr(rolling_avg)
            ),
        })
    } else {
        None
    }
}

fn check_rate_of_change(reading: &SensorReading, window: &RollingWindow, condition: &DriftCondition) -> Option<Alert> {
    let (previous, latest) = window.last_two()?;
    let rate = (latest - previous).abs();
    if rate > condition.rate_of_change {
        Some(Alert {
            timestamp: reading.timestamp,
            sensor: reading.sensor_name.clone(),
            kind: AlertKind::RateOfChange,
            value: reading.value,
            message: format!(
                "{} - WARNING: {} abnormal rate of change detected! (Rate: {})",
                reading.timestamp.format(TIMESTAMP_FORMAT),
                reading.sensor_name,
                Repr(rate)
            ),
        })
    } else {
        None
    }
}

/// Shortest round-trip rendering in the layout the alert log has always used:
/// `96.0`, `1e+16`, `1.5e-05`, `nan`, `-inf`.
struct Repr(f64);

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        if v.is_nan() {
            return f.write_str("nan");
        }
        if v.is_infinite() {
            return f.write_str(if v > 0.0 { "inf" } else { "-inf" });
        }
        // Debug switches to exponent form below 1e-4 and from 1e16 up
        let text = format!("{v:?}");
        match text.split_once('e') {
            Some((mantissa, exp)) => match exp.strip_prefix('-') {
                Some(digits) => write!(f, "{mantissa}e-{digits:0>2}"),
                None => write!(f, "{mantissa}e+{exp:0>2}"),
            },
            None => f.write_str(&text),
        }
    }
}
