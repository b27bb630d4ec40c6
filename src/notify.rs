use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;
use crate::types::{Alert, TIMESTAMP_FORMAT};

const SUBJECT: &str = "SCADA ALERT: Sensor Issue Detected";

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("email build error: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("notification timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Trait for alert delivery channels.
///
/// Delivery is best-effort: callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotificationError>;
}

/// Plain-text email over an implicit-TLS SMTP relay
pub struct EmailNotifier {
    sender: lettre::message::Mailbox,
    receiver: lettre::message::Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self, NotificationError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)?.port(config.smtp_port);

        if let Some(ref password) = config.sender_password {
            builder = builder.credentials(Credentials::new(config.sender_email.clone(), password.clone()));
        }

        Ok(Self {
            sender: config.sender_email.parse()?,
            receiver: config.receiver_email.parse()?,
            transport: builder.build(),
        })
    }

    fn build_message(&self, alert: &Alert) -> Result<Message, NotificationError> {
        Message::builder()
            .from(self.sender.clone())
            .to(self.receiver.clone())
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(email_body(alert))
            .map_err(|e| NotificationError::Build(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotificationError> {
        let message = self.build_message(alert)?;
        self.transport.send(message).await?;
        tracing::info!(to = %self.receiver, sensor = %alert.sensor, "Alert email sent");
        Ok(())
    }
}

fn email_body(alert: &Alert) -> String {
    format!("Time: {}\nAlert: {}", Utc::now().format(TIMESTAMP_FORMAT), alert.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertKind;

    fn config() -> EmailConfig {
        EmailConfig {
            sender_email: "scada@example.com".into(),
            receiver_email: "ops@example.com".into(),
            smtp_server: "smtp.example.com".into(),
            smtp_port: 465,
            sender_password: Some("secret".into()),
        }
    }

    fn alert() -> Alert {
        Alert {
            timestamp: Utc::now(),
            sensor: "pressure".into(),
            kind: AlertKind::RateOfChange,
            value: 12.0,
            message: "pressure jumped".into(),
        }
    }

    #[test]
    fn builds_plain_text_message() {
        let notifier = EmailNotifier::new(&config()).unwrap();
        let message = notifier.build_message(&alert()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: SCADA ALERT: Sensor Issue Detected"));
        assert!(raw.contains("To: ops@example.com"));
        assert!(raw.contains("Alert: pressure jumped"));
        assert_eq!(notifier.name(), "email");
    }

    #[test]
    fn bad_receiver_address_is_rejected() {
        let mut cfg = config();
        cfg.receiver_email = "not-an-email".into();
        let err = EmailNotifier::new(&cfg).err().unwrap();
        assert!(matches!(err, NotificationError::Address(_)));
    }

    #[test]
    fn body_carries_alert_text() {
        let body = email_body(&alert());
        assert!(body.starts_with("Time: "));
        assert!(body.ends_with("\nAlert: pressure jumped"));
    }
}
