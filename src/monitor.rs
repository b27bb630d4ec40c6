use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::analyzer::DriftDetector;
use crate::config::{Config, DriftConditions};
use crate::connection::{ConnectionError, ConnectionManager, Connector};
use crate::notify::{EmailNotifier, NotificationError, Notifier};
use crate::retry::RetryPolicy;
use crate::storage::{AlertSink, ReadingSink, SqliteAlertStore, SqliteReadingStore};
use crate::transport::{connect_and_subscribe, MqttSession};
use crate::types::{Alert, SensorReading};

/// An inbound payload that could not be turned into readings
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] json5::Error),

    #[error("payload is a JSON {0}, expected an object of sensor values")]
    NotAnObject(&'static str),
}

/// What happened to one inbound message
#[derive(Debug, Default)]
pub struct MessageReport {
    pub readings: usize,
    /// Keys whose value was not a number
    pub skipped: usize,
    pub reading_stored: bool,
    pub alerts: Vec<Alert>,
    pub alerts_stored: usize,
}

/// The ingestion loop: decode, persist, evaluate, alert.
///
/// One monitor serves one subscription and processes messages strictly one
/// at a time. It owns its detector, so two monitors never share windows.
pub struct Monitor {
    detector: DriftDetector,
    conditions: DriftConditions,
    alerts: Box<dyn AlertSink>,
    readings: Box<dyn ReadingSink>,
    notifier: Option<Arc<dyn Notifier>>,
    storage_policy: RetryPolicy,
    notify_timeout: Duration,
    pending: JoinSet<()>,
}

impl Monitor {
    pub fn new(conditions: DriftConditions, alerts: Box<dyn AlertSink>, readings: Box<dyn ReadingSink>) -> Self {
        Self {
            detector: DriftDetector::new(),
            conditions,
            alerts,
            readings,
            notifier: None,
            storage_policy: RetryPolicy::new(3, Duration::from_secs(1)),
            notify_timeout: Duration::from_secs(30),
            pending: JoinSet::new(),
        }
    }

    /// Open the SQLite stores and the email channel described by `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = &config.monitor.database;
        let alerts = SqliteAlertStore::open(db).with_context(|| format!("Failed to open alert store at {db}"))?;
        let readings =
            SqliteReadingStore::open(db).with_context(|| format!("Failed to open reading store at {db}"))?;

        let mut monitor = Self::new(config.drift_conditions.clone(), Box::new(alerts), Box::new(readings))
            .with_storage_policy(config.monitor.storage_policy())
            .with_notify_timeout(config.monitor.notify_timeout());

        match config.email {
            Some(ref email) => {
                let notifier = EmailNotifier::new(email).context("Failed to set up email notification")?;
                monitor = monitor.with_notifier(Arc::new(notifier));
            }
            None => info!("No email configuration, notifications disabled"),
        }

        info!(sensors = config.drift_conditions.len(), database = %db, "Monitor initialized");
        Ok(monitor)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_storage_policy(mut self, policy: RetryPolicy) -> Self {
        self.storage_policy = policy;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    /// Consume messages until the connection can no longer be re-established
    pub async fn run<C>(&mut self, manager: &ConnectionManager, connector: &C, topic: &str) -> Result<(), ConnectionError>
    where
        C: Connector<Client = MqttSession>,
    {
        let mut session = connect_and_subscribe(manager, connector, topic).await?;

        loop {
            match session.next_publish().await {
                Ok(publish) => match self.handle_message(&publish.payload).await {
                    Ok(report) => debug!(
                        topic = %publish.topic,
                        readings = report.readings,
                        alerts = report.alerts.len(),
                        "Message processed"
                    ),
                    Err(e) => warn!(topic = %publish.topic, error = %e, "Skipping malformed message"),
                },
                Err(e) => {
                    warn!(endpoint = %connector.endpoint(), error = %e, "Connection lost, reconnecting");
                    session = connect_and_subscribe(manager, connector, topic).await?;
                }
            }
        }
    }

    /// Handle one raw payload stamped with the current time
    pub async fn handle_message(&mut self, payload: &[u8]) -> Result<MessageReport, MalformedMessage> {
        let (values, skipped) = decode_payload(payload)?;
        let mut report = self.process(Utc::now(), &values).await;
        report.skipped = skipped;
        Ok(report)
    }

    /// Persist the reading, evaluate every value, then persist and forward alerts
    pub async fn process(&mut self, timestamp: DateTime<Utc>, values: &BTreeMap<String, f64>) -> MessageReport {
        let mut report = MessageReport {
            readings: values.len(),
            ..MessageReport::default()
        };

        let policy = self.storage_policy;
        let readings = &mut self.readings;
        report.reading_stored = match policy
            .run("store reading", || std::future::ready(readings.append_readings(timestamp, values)))
            .await
        {
            Ok(()) => true,
            Err(exhausted) => {
                error!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Dropping sensor reading"
                );
                false
            }
        };

        for (name, value) in values {
            let reading = SensorReading::new(name.clone(), *value, timestamp);
            report.alerts.extend(self.detector.evaluate(&reading, &self.conditions));
        }

        for alert in &report.alerts {
            if self.store_alert(alert).await {
                report.alerts_stored += 1;
            }
            self.dispatch_notification(alert);
        }

        report
    }

    async fn store_alert(&mut self, alert: &Alert) -> bool {
        let policy = self.storage_policy;
        let alerts = &mut self.alerts;
        match policy
            .run("store alert", || std::future::ready(alerts.append_alert(alert)))
            .await
        {
            Ok(()) => {
                info!(sensor = %alert.sensor, kind = %alert.kind, "ALERT LOGGED: {}", alert.message);
                true
            }
            Err(exhausted) => {
                error!(
                    sensor = %alert.sensor,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Dropping alert: {}",
                    alert.message
                );
                false
            }
        }
    }

    /// Fire-and-forget: the send runs on its own task so a slow mail server
    /// never holds up ingestion.
    fn dispatch_notification(&mut self, alert: &Alert) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };

        // reap finished sends
        while self.pending.try_join_next().is_some() {}

        let alert = alert.clone();
        let timeout = self.notify_timeout;
        self.pending.spawn(async move {
            let result = match tokio::time::timeout(timeout, notifier.notify(&alert)).await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout(timeout)),
            };
            if let Err(e) = result {
                warn!(channel = notifier.name(), sensor = %alert.sensor, error = %e, "Notification failed");
            }
        });
    }

    /// Wait for notifications still in flight
    pub async fn flush_notifications(&mut self) {
        while let Some(joined) = self.pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Notification task aborted");
            }
        }
    }
}

// Only the shape matters; variant contents are discarded.
#[allow(dead_code)]
#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Object(BTreeMap<String, Field>),
    Array(Vec<IgnoredAny>),
    Number(f64),
    Boolean(bool),
    String(String),
    Null,
}

#[allow(dead_code)]
#[derive(Deserialize)]
#[serde(untagged)]
enum Field {
    Number(f64),
    Other(IgnoredAny),
}

/// Decode a flat JSON object of sensor values.
///
/// The bare tokens `NaN`, `Infinity` and `-Infinity` are accepted as numbers,
/// since upstream generators emit them for out-of-range readings.
/// Returns the numeric entries and the count of entries that were skipped
/// because their value was not a number.
pub fn decode_payload(payload: &[u8]) -> Result<(BTreeMap<String, f64>, usize), MalformedMessage> {
    let text = std::str::from_utf8(payload)?;

    let object = match json5::from_str::<Payload>(text)? {
        Payload::Object(map) => map,
        Payload::Array(_) => return Err(MalformedMessage::NotAnObject("array")),
        Payload::String(_) => return Err(MalformedMessage::NotAnObject("string")),
        Payload::Number(_) => return Err(MalformedMessage::NotAnObject("number")),
        Payload::Boolean(_) => return Err(MalformedMessage::NotAnObject("boolean")),
        Payload::Null => return Err(MalformedMessage::NotAnObject("null")),
    };

    let mut values = BTreeMap::new();
    let mut skipped = 0;
    for (name, field) in object {
        match field {
            Field::Number(n) => {
                values.insert(name, n);
            }
            Field::Other(_) => {
                debug!(sensor = %name, "Ignoring non-numeric sensor value");
                skipped += 1;
            }
        }
    }
    Ok((values, skipped))
}
