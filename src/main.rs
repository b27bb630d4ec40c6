use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use scada_monitor::config::Config;
use scada_monitor::connection::ConnectionManager;
use scada_monitor::monitor::Monitor;
use scada_monitor::publisher::{run_publisher, SensorSimulator};
use scada_monitor::storage::{SqliteAlertStore, SqliteReadingStore};
use scada_monitor::transport::MqttConnector;

#[derive(Parser, Debug)]
#[command(name = "scada-monitor", version, about = "Real-time SCADA sensor drift monitor")]
struct Cli {
    /// Path to configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to sensor readings and raise drift alerts (default)
    Monitor,
    /// Publish simulated sensor readings
    Publish,
    /// Validate config and exit
    Check,
    /// Show the most recent alerts
    Alerts {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show the most recent stored readings
    Readings {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).context("Configuration validation failed")?;

    // Initialize logging
    init_logging(&config);
    for warning in &config.warnings {
        warn!("{warning}");
    }

    match cli.command.unwrap_or(Command::Monitor) {
        Command::Check => {
            print_summary(&config);
            Ok(())
        }
        Command::Alerts { limit } => {
            let store = SqliteAlertStore::open(&config.monitor.database)?;
            for record in store.recent_alerts(limit)? {
                println!("{} - {}", record.timestamp, record.alert_message);
            }
            Ok(())
        }
        Command::Readings { limit } => {
            let store = SqliteReadingStore::open(&config.monitor.database)?;
            for reading in store.recent_readings(limit)? {
                println!("{}", serde_json::to_string(&reading)?);
            }
            Ok(())
        }
        Command::Monitor => {
            info!(version = env!("CARGO_PKG_VERSION"), topic = %config.mqtt.topic, "Starting SCADA monitor");
            let mut monitor = Monitor::from_config(&config)?;
            let manager = ConnectionManager::new(config.monitor.connect_policy());
            let connector = MqttConnector::new(&config.mqtt, "monitor", config.monitor.connect_timeout());

            let outcome = tokio::select! {
                result = monitor.run(&manager, &connector, &config.mqtt.topic) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting");
                    Ok(())
                }
            };
            monitor.flush_notifications().await;

            if let Err(e) = outcome {
                error!(error = %e, "Monitor terminated with error");
                return Err(e.into());
            }
            Ok(())
        }
        Command::Publish => {
            let simulator = SensorSimulator::new(&config.sensors, config.publisher.variation);
            if simulator.is_empty() {
                anyhow::bail!("No sensor has a base_value to publish");
            }
            let manager = ConnectionManager::new(config.monitor.connect_policy());
            let connector = MqttConnector::new(&config.mqtt, "publisher", config.monitor.connect_timeout());
            let interval = std::time::Duration::from_secs(config.publisher.interval_secs);

            tokio::select! {
                result = run_publisher(&manager, &connector, &config.mqtt.topic, &simulator, interval) => {
                    if let Err(e) = result {
                        error!(error = %e, "Publisher terminated with error");
                        return Err(e.into());
                    }
                }
                _ = tokio::signal::ctrl_c() => info!("Publisher stopped by user"),
            }
            Ok(())
        }
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitor.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_summary(config: &Config) {
    println!("Configuration is valid.");
    println!("  broker:   {}:{} (topic {})", config.mqtt.broker, config.mqtt.port, config.mqtt.topic);
    println!("  sensors:  {}", config.sensors.len());
    let mut monitored: Vec<_> = config.drift_conditions.keys().map(String::as_str).collect();
    monitored.sort_unstable();
    println!("  drift:    {}", monitored.join(", "));
    println!("  email:    {}", if config.email.is_some() { "enabled" } else { "disabled" });
    println!("  database: {}", config.monitor.database);
}
