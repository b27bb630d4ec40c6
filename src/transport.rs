use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use tracing::{debug, info};

use crate::config::MqttConfig;
use crate::connection::{ConnectionError, ConnectionManager, Connector};

/// Requests buffered between the client handle and the event loop
const CHANNEL_CAPACITY: usize = 64;

/// Opens MQTT sessions against one broker
pub struct MqttConnector {
    config: MqttConfig,
    client_id: String,
    connect_timeout: Duration,
}

impl MqttConnector {
    /// `role` keeps the monitor and publisher from sharing a client id
    pub fn new(config: &MqttConfig, role: &str, connect_timeout: Duration) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(|| default_client_id(role));
        Self {
            config: config.clone(),
            client_id,
            connect_timeout,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.broker, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if let Some(ref username) = self.config.username {
            options.set_credentials(username, self.config.password.as_deref().unwrap_or_default());
        }
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Client = MqttSession;

    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.config.broker, self.config.port)
    }

    async fn connect(&self) -> anyhow::Result<MqttSession> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), CHANNEL_CAPACITY);

        let acked = tokio::time::timeout(self.connect_timeout, async {
            loop {
                if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                    return Ok::<_, rumqttc::ConnectionError>(ack);
                }
            }
        })
        .await;

        match acked {
            Ok(Ok(ack)) => {
                debug!(client_id = %self.client_id, session_present = ack.session_present, "CONNACK received");
                Ok(MqttSession { client, eventloop })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => bail!("no CONNACK within {:?}", self.connect_timeout),
        }
    }
}

/// A live broker connection: the request handle plus the event loop that
/// has to be polled for anything to go over the wire.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttSession {
    pub async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await
    }

    /// Queue a publish without waiting; sent on the next poll
    pub fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.client.try_publish(topic, QoS::AtMostOnce, false, payload)
    }

    /// Drive the event loop once
    pub async fn poll(&mut self) -> Result<Event, rumqttc::ConnectionError> {
        self.eventloop.poll().await
    }

    /// Wait for the next inbound publish, driving keep-alives and acks meanwhile
    pub async fn next_publish(&mut self) -> Result<Publish, rumqttc::ConnectionError> {
        loop {
            if let Event::Incoming(Packet::Publish(publish)) = self.eventloop.poll().await? {
                return Ok(publish);
            }
        }
    }
}

/// Connect through the manager and subscribe to `topic`
pub async fn connect_and_subscribe<C>(
    manager: &ConnectionManager,
    connector: &C,
    topic: &str,
) -> Result<MqttSession, ConnectionError>
where
    C: Connector<Client = MqttSession>,
{
    let session = manager.connect(connector).await?;
    session.subscribe(topic).await.map_err(|e| ConnectionError {
        endpoint: connector.endpoint(),
        attempts: 1,
        last_error: format!("subscribe to {topic} failed: {e}"),
    })?;
    info!(topic, "Subscribed to MQTT topic");
    Ok(session)
}

fn default_client_id(role: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".into());
    format!("scada-{}-{}-{}", role, host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "localhost".into(),
            port: 1883,
            topic: "scada/sensors".into(),
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 60,
        }
    }

    #[test]
    fn client_ids_differ_by_role() {
        let monitor = MqttConnector::new(&config(), "monitor", Duration::from_secs(1));
        let publisher = MqttConnector::new(&config(), "publisher", Duration::from_secs(1));
        assert!(monitor.client_id().starts_with("scada-monitor-"));
        assert_ne!(monitor.client_id(), publisher.client_id());
        assert_eq!(monitor.endpoint(), "mqtt://localhost:1883");
    }

    #[test]
    fn configured_client_id_wins() {
        let mut cfg = config();
        cfg.client_id = Some("plant-7".into());
        let connector = MqttConnector::new(&cfg, "monitor", Duration::from_secs(1));
        assert_eq!(connector.client_id(), "plant-7");
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast() {
        let mut cfg = config();
        cfg.broker = "127.0.0.1".into();
        cfg.port = 1; // nothing listens here
        let connector = MqttConnector::new(&cfg, "test", Duration::from_secs(2));
        assert!(connector.connect().await.is_err());
    }
}
