use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::config::MailConfig;

/// Outbound message delivery. The authority only ever hands over an address,
/// a subject and a body; transport details live behind this seam.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct SendMailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Mailer posting to an HTTP mail API. The client-level timeout bounds the
/// only externally-latent call in the auth flows.
pub struct HttpMailer {
    http: reqwest::Client,
    base_url: String,
    sender: String,
}

impl HttpMailer {
    pub fn new(config: &MailConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            sender: config.sender.clone(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let url = format!("{}/email", self.base_url);
        let request = SendMailRequest {
            from: &self.sender,
            to,
            subject,
            text: body,
        };
        self.http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "mail request failed");
                anyhow::anyhow!(e)
            })?
            .error_for_status()
            .map_err(|e| {
                error!(error = %e, "mail service returned error");
                anyhow::anyhow!(e)
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Test double: records every message and can be switched to fail, so
/// delivery-rollback paths are exercisable without a mail service.
#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl FakeMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("mail service unavailable");
        }
        self.sent.lock().unwrap().push(SentMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_mailer_records_messages() {
        let mailer = FakeMailer::new();
        mailer
            .send("ann@example.com", "hi", "body")
            .await
            .expect("send");
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ann@example.com");
    }

    #[tokio::test]
    async fn fake_mailer_can_simulate_outage() {
        let mailer = FakeMailer::new();
        mailer.set_failing(true);
        assert!(mailer.send("ann@example.com", "hi", "body").await.is_err());
        assert!(mailer.sent().is_empty());
    }
}
