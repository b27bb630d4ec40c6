use async_trait::async_trait;
use tracing::{error, info};

use crate::retry::RetryPolicy;

/// Something that can open a transport connection.
///
/// The MQTT connector implements this for real brokers; tests plug in stubs.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: Send;

    /// Human-readable endpoint used in logs and errors
    fn endpoint(&self) -> String;

    /// Make a single connection attempt
    async fn connect(&self) -> anyhow::Result<Self::Client>;
}

/// Raised once every connection attempt has failed
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to {endpoint} after {attempts} attempts: {last_error}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Wraps connector calls with a bounded, linear retry budget
#[derive(Debug, Clone, Copy)]
pub struct ConnectionManager {
    policy: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn connect<C: Connector>(&self, connector: &C) -> Result<C::Client, ConnectionError> {
        let endpoint = connector.endpoint();
        info!(endpoint = %endpoint, max_attempts = self.policy.attempts(), "Connecting");

        match self
            .policy
            .run("connect", || async { connector.connect().await.map_err(|e| format!("{e:#}")) })
            .await
        {
            Ok(client) => {
                info!(endpoint = %endpoint, "Connection established");
                Ok(client)
            }
            Err(exhausted) => {
                error!(
                    endpoint = %endpoint,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Giving up on connection"
                );
                Err(ConnectionError {
                    endpoint,
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls, then hands out the call number
    struct StubConnector {
        failures: u32,
        calls: AtomicU32,
    }

    impl StubConnector {
        fn failing(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0) }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        type Client = u32;

        fn endpoint(&self) -> String {
            "stub:1883".into()
        }

        async fn connect(&self) -> anyhow::Result<u32> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                anyhow::bail!("connection refused (call {n})");
            }
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let manager = ConnectionManager::new(RetryPolicy::new(3, Duration::from_secs(5)));
        let stub = StubConnector::failing(2);

        let client = manager.connect(&stub).await.unwrap();

        assert_eq!(client, 3);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_a_connection_error() {
        let manager = ConnectionManager::new(RetryPolicy::new(2, Duration::from_secs(5)));
        let stub = StubConnector::failing(u32::MAX);
        let started = tokio::time::Instant::now();

        let err = manager.connect(&stub).await.unwrap_err();

        assert_eq!(stub.calls(), 2);
        assert_eq!(err.attempts, 2);
        assert_eq!(err.endpoint, "stub:1883");
        assert!(err.last_error.contains("connection refused"));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_skips_the_delay() {
        let manager = ConnectionManager::new(RetryPolicy::new(5, Duration::from_secs(5)));
        let stub = StubConnector::failing(0);
        let started = tokio::time::Instant::now();

        manager.connect(&stub).await.unwrap();

        assert_eq!(stub.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
