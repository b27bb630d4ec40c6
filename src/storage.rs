use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::{Alert, TIMESTAMP_FORMAT};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sensor name {0:?} cannot be used as a column")]
    InvalidColumn(String),
}

/// Append-only destination for alerts
pub trait AlertSink: Send {
    fn append_alert(&mut self, alert: &Alert) -> Result<(), StorageError>;
}

/// Append-only destination for raw readings, one row per message
pub trait ReadingSink: Send {
    fn append_readings(
        &mut self,
        timestamp: DateTime<Utc>,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), StorageError>;
}

/// Persisted alert row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub timestamp: String,
    pub alert_message: String,
}

/// Persisted reading row. Columns added after the row was written read as `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub id: i64,
    pub timestamp: String,
    pub values: BTreeMap<String, Option<f64>>,
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// `alerts(id, timestamp, alert_message)` in SQLite
pub struct SqliteAlertStore {
    conn: Connection,
}

impl SqliteAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let store = Self::with_connection(open_connection(path)?)?;
        info!(path = %path.display(), "Alert store ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT,
                alert_message TEXT
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Newest first
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, timestamp, alert_message FROM alerts ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(AlertRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                alert_message: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl AlertSink for SqliteAlertStore {
    fn append_alert(&mut self, alert: &Alert) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO alerts (timestamp, alert_message) VALUES (?1, ?2)",
            params![alert.timestamp_text(), alert.message],
        )?;
        Ok(())
    }
}

const RESERVED_COLUMNS: [&str; 2] = ["id", "timestamp"];

/// `sensor_data(id, timestamp, <sensor> REAL...)` in SQLite.
///
/// Sensor names are not known upfront. A column is added the first time a
/// name shows up; the set of known columns is cached so the common path is a
/// single INSERT. SQLite column names are case-insensitive, so the cache is
/// keyed by lowercase name.
pub struct SqliteReadingStore {
    conn: Connection,
    known_columns: HashSet<String>,
}

impl SqliteReadingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let store = Self::with_connection(open_connection(path)?)?;
        info!(path = %path.display(), columns = store.known_columns.len(), "Reading store ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sensor_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT
            )",
            [],
        )?;
        let mut store = Self {
            conn,
            known_columns: HashSet::new(),
        };
        store.reload_columns()?;
        Ok(store)
    }

    fn reload_columns(&mut self) -> Result<(), StorageError> {
        self.known_columns = table_columns(&self.conn)?
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        Ok(())
    }

    /// Sensor columns currently in the table, in schema order
    pub fn sensor_columns(&self) -> Result<Vec<String>, StorageError> {
        Ok(table_columns(&self.conn)?
            .into_iter()
            .filter(|c| !is_reserved(c))
            .collect())
    }

    fn ensure_column(&mut self, name: &str) -> Result<(), StorageError> {
        let key = name.to_lowercase();
        if self.known_columns.contains(&key) {
            return Ok(());
        }
        let added = self.conn.execute(
            &format!("ALTER TABLE sensor_data ADD COLUMN {} REAL", quote_ident(name)),
            [],
        );
        if let Err(e) = added {
            // another writer on the same file may have added it since we cached
            self.reload_columns()?;
            if self.known_columns.contains(&key) {
                debug!(column = name, "Sensor column added by another writer");
                return Ok(());
            }
            return Err(e.into());
        }
        info!(column = name, "Added sensor column");
        self.known_columns.insert(key);
        Ok(())
    }

    /// Newest first
    pub fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM sensor_data ORDER BY id DESC LIMIT ?1")?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt.query_map([limit as i64], |row| {
            let mut reading = StoredReading {
                id: 0,
                timestamp: String::new(),
                values: BTreeMap::new(),
            };
            for (i, column) in columns.iter().enumerate() {
                match column.as_str() {
                    "id" => reading.id = row.get(i)?,
                    "timestamp" => reading.timestamp = row.get::<_, Option<String>>(i)?.unwrap_or_default(),
                    _ => {
                        reading.values.insert(column.clone(), row.get(i)?);
                    }
                }
            }
            Ok(reading)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM sensor_data", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl ReadingSink for SqliteReadingStore {
    fn append_readings(
        &mut self,
        timestamp: DateTime<Utc>,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), StorageError> {
        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len() + 1);
        params.push(Value::Text(timestamp.format(TIMESTAMP_FORMAT).to_string()));

        for (name, value) in values {
            if is_reserved(name) || name.is_empty() {
                warn!(sensor = %name, "Skipping sensor whose name collides with a reserved column");
                continue;
            }
            if !seen.insert(name.to_lowercase()) {
                warn!(sensor = %name, "Skipping sensor that differs from another only by case");
                continue;
            }
            self.ensure_column(name)?;
            columns.push(quote_ident(name));
            params.push(Value::Real(*value));
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
        let mut column_list = vec!["timestamp".to_string()];
        column_list.extend(columns);
        let sql = format!(
            "INSERT INTO sensor_data ({}) VALUES ({})",
            column_list.join(", "),
            placeholders.join(", ")
        );

        self.conn.execute(&sql, params_from_iter(params))?;
        Ok(())
    }
}

fn table_columns(conn: &Connection) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('sensor_data')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(names.collect::<Result<Vec<_>, _>>()?)
}

fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
