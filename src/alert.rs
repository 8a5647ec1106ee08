use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};

use crate::models::deployment::RollbackEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// "webhook", "slack" or "email".
    pub channel_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

/// Fans rollback notifications out to the configured channels. Dispatch is
/// best-effort: a dead channel is logged, never propagated into the
/// rollback sequence itself.
pub struct AlertDispatcher {
    http: reqwest::Client,
    channels: Vec<ChannelConfig>,
    smtp_config: SmtpConfig,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl AlertDispatcher {
    pub fn new(http: reqwest::Client, channels: Vec<ChannelConfig>, smtp_config: SmtpConfig) -> Self {
        let smtp = build_smtp_transport(&smtp_config);
        if smtp.is_some() {
            tracing::info!("alert dispatcher: SMTP configured for email notifications");
        }
        Self {
            http,
            channels,
            smtp_config,
            smtp,
        }
    }

    pub async fn notify(
        &self,
        severity: Severity,
        subject: &str,
        message: &str,
        event: Option<&RollbackEvent>,
    ) {
        for channel in &self.channels {
            match channel.channel_type.as_str() {
                "email" => {
                    let Some(to_addr) = channel.to.as_deref() else {
                        continue;
                    };
                    let Some(transport) = &self.smtp else {
                        tracing::warn!(
                            "channel {}: email configured but SMTP not set up",
                            channel.name
                        );
                        continue;
                    };
                    let full_subject = format!("[{severity}] {subject}");
                    match Message::builder()
                        .from(
                            self.smtp_config
                                .from
                                .parse()
                                .unwrap_or_else(|_| "guard@localhost".parse().unwrap()),
                        )
                        .to(to_addr
                            .parse()
                            .unwrap_or_else(|_| "noreply@localhost".parse().unwrap()))
                        .subject(full_subject)
                        .header(ContentType::TEXT_PLAIN)
                        .body(message.to_string())
                    {
                        Ok(email) => {
                            if let Err(e) = transport.send(email).await {
                                tracing::warn!(
                                    "channel {}: email to {to_addr} failed: {e}",
                                    channel.name
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!("channel {}: failed to build email: {e}", channel.name);
                        }
                    }
                }
                "slack" => {
                    let Some(url) = channel.url.as_deref() else {
                        continue;
                    };
                    let payload =
                        serde_json::json!({ "text": format!("[{severity}] {subject}: {message}") });
                    if let Err(e) = self.http.post(url).json(&payload).send().await {
                        tracing::warn!("channel {}: notification failed: {e}", channel.name);
                    }
                }
                _ => {
                    // webhook
                    let Some(url) = channel.url.as_deref() else {
                        continue;
                    };
                    let payload = serde_json::json!({
                        "severity": severity,
                        "subject": subject,
                        "message": message,
                        "event": event,
                    });
                    if let Err(e) = self.http.post(url).json(&payload).send().await {
                        tracing::warn!("channel {}: notification failed: {e}", channel.name);
                    }
                }
            }
        }
    }
}
