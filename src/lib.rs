pub mod analyzer;
pub mod config;
pub mod connection;
pub mod monitor;
pub mod notify;
pub mod publisher;
pub mod retry;
pub mod storage;
pub mod transport;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::Serialize;

    /// Timestamp layout used in alert text and persisted rows
    pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /// A single sensor measurement decoded from an inbound message
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct SensorReading {
        pub sensor_name: String,
        pub value: f64,
        pub timestamp: DateTime<Utc>,
    }

    impl SensorReading {
        pub fn new(sensor_name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
            Self {
                sensor_name: sensor_name.into(),
                value,
                timestamp,
            }
        }
    }

    /// Which drift rule produced an alert
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub enum AlertKind {
        Drift,
        RateOfChange,
    }

    /// An alert raised by the drift detector. Never mutated once built.
    #[derive(Debug, Clone, Serialize)]
    pub struct Alert {
        pub timestamp: DateTime<Utc>,
        pub sensor: String,
        pub kind: AlertKind,
        pub value: f64,
        pub message: String,
    }

    impl Alert {
        /// Timestamp rendered the way it is persisted
        pub fn timestamp_text(&self) -> String {
            self.timestamp.format(TIMESTAMP_FORMAT).to_string()
        }
    }

    impl std::fmt::Display for AlertKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AlertKind::Drift => write!(f, "drift"),
                AlertKind::RateOfChange => write!(f, "rate_of_change"),
            }
        }
    }

    impl std::fmt::Display for Alert {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.message)
        }
    }
}
