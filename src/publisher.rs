use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SensorConfig;
use crate::connection::{ConnectionError, ConnectionManager, Connector};
use crate::transport::MqttSession;

/// Produces one synthetic value per sensor around its base value
#[derive(Debug, Clone)]
pub struct SensorSimulator {
    sensors: Vec<(String, f64)>,
    variation: f64,
}

impl SensorSimulator {
    /// Sensors without a `base_value` have nothing to simulate and are left out
    pub fn new(sensors: &[SensorConfig], variation: f64) -> Self {
        let sensors = sensors
            .iter()
            .filter_map(|s| match s.base_value {
                Some(base) => Some((s.name.clone(), base)),
                None => {
                    warn!(sensor = %s.name, "Sensor has no base_value, not publishing it");
                    None
                }
            })
            .collect();
        Self {
            sensors,
            variation: variation.abs(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// `base ± variation * |base|`, uniform, rounded to two decimals
    pub fn sample<R: Rng>(&self, rng: &mut R) -> BTreeMap<String, f64> {
        self.sensors
            .iter()
            .map(|(name, base)| {
                let spread = base.abs() * self.variation;
                let value = base + rng.gen_range(-spread..=spread);
                (name.clone(), (value * 100.0).round() / 100.0)
            })
            .collect()
    }
}

enum Step {
    Publish,
    Idle,
    Reconnect(rumqttc::ConnectionError),
}

/// Publish a simulated reading every `interval` until the broker is gone for good
pub async fn run_publisher<C>(
    manager: &ConnectionManager,
    connector: &C,
    topic: &str,
    simulator: &SensorSimulator,
    interval: Duration,
) -> Result<(), ConnectionError>
where
    C: Connector<Client = MqttSession>,
{
    let mut session = manager.connect(connector).await?;
    let mut ticker = tokio::time::interval(interval);
    info!(topic, sensors = simulator.sensors.len(), "Publishing to topic");

    loop {
        let step = tokio::select! {
            _ = ticker.tick() => Step::Publish,
            polled = session.poll() => match polled {
                Ok(_) => Step::Idle,
                Err(e) => Step::Reconnect(e),
            },
        };

        match step {
            Step::Publish => {
                let sample = simulator.sample(&mut rand::thread_rng());
                let payload = match serde_json::to_vec(&sample) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize sample");
                        continue;
                    }
                };
                match session.try_publish(topic, payload) {
                    Ok(()) => debug!(?sample, "Published"),
                    Err(e) => warn!(error = %e, "Publish not queued"),
                }
            }
            Step::Idle => {}
            Step::Reconnect(e) => {
                warn!(endpoint = %connector.endpoint(), error = %e, "Connection lost, reconnecting");
                session = manager.connect(connector).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sensors() -> Vec<SensorConfig> {
        vec![
            SensorConfig { name: "temperature".into(), base_value: Some(100.0) },
            SensorConfig { name: "pressure".into(), base_value: Some(10.0) },
            SensorConfig { name: "vibration".into(), base_value: None },
        ]
    }

    #[test]
    fn samples_stay_within_variation() {
        let sim = SensorSimulator::new(&sensors(), 0.05);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let sample = sim.sample(&mut rng);
            assert_eq!(sample.len(), 2);
            assert!((95.0..=105.0).contains(&sample["temperature"]));
            assert!((9.5..=10.5).contains(&sample["pressure"]));
        }
    }

    #[test]
    fn values_are_rounded_to_two_decimals() {
        let sim = SensorSimulator::new(&sensors(), 0.05);
        let mut rng = StdRng::seed_from_u64(42);
        for value in sim.sample(&mut rng).values() {
            let scaled = value * 100.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_and_negative_bases_are_handled() {
        let sim = SensorSimulator::new(
            &[
                SensorConfig { name: "offset".into(), base_value: Some(0.0) },
                SensorConfig { name: "vacuum".into(), base_value: Some(-20.0) },
            ],
            0.05,
        );
        let sample = sim.sample(&mut StdRng::seed_from_u64(1));
        assert_eq!(sample["offset"], 0.0);
        assert!((-21.0..=-19.0).contains(&sample["vacuum"]));
    }

    #[test]
    fn payload_is_a_flat_json_object() {
        let sim = SensorSimulator::new(&sensors(), 0.0);
        let payload = serde_json::to_string(&sim.sample(&mut StdRng::seed_from_u64(3))).unwrap();
        assert_eq!(payload, r#"{"pressure":10.0,"temperature":100.0}"#);
    }
}
