use std::{env, time::Duration};

use anyhow::{Context, Result};
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::{Value, json};

const EMAIL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Delivery backends. Failure is logged by the caller and never invalidates
/// the digest.
pub enum EmailTransport {
    HttpApi {
        endpoint: String,
        api_key: String,
    },
    Smtp {
        host: String,
        port: u16,
        starttls: bool,
        username: Option<String>,
        password: Option<String>,
    },
}

impl EmailTransport {
    /// HTTP API when EMAIL_API_URL/EMAIL_API_KEY are present, SMTP when
    /// SMTP_HOST is; None disables delivery.
    pub fn from_env() -> Option<Self> {
        if let (Ok(endpoint), Ok(api_key)) = (env::var("EMAIL_API_URL"), env::var("EMAIL_API_KEY")) {
            if !endpoint.is_empty() && !api_key.is_empty() {
                return Some(EmailTransport::HttpApi { endpoint, api_key });
            }
        }
        let host = env::var("SMTP_HOST").ok().filter(|h| !h.is_empty())?;
        let port = env::var("SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587);
        let starttls = env::var("SMTP_TLS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        Some(EmailTransport::Smtp {
            host,
            port,
            starttls,
            username: env::var("SMTP_USERNAME").ok().filter(|s| !s.is_empty()),
            password: env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
        })
    }

    pub async fn send(&self, http: &Client, msg: &EmailMessage) -> Result<()> {
        match self {
            EmailTransport::HttpApi { endpoint, api_key } => {
                let resp = http
                    .post(endpoint)
                    .bearer_auth(api_key)
                    .timeout(EMAIL_TIMEOUT)
                    .json(&http_payload(msg))
                    .send()
                    .await
                    .context("email API send")?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("email API HTTP {status}: {}", crate::utils::snippet(&body, 200));
                }
                Ok(())
            }
            EmailTransport::Smtp {
                host,
                port,
                starttls,
                username,
                password,
            } => {
                let email = build_message(msg)?;
                let mut builder = if *starttls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                        .context("smtp relay config")?
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                };
                builder = builder.port(*port).timeout(Some(EMAIL_TIMEOUT));
                if let (Some(user), Some(pass)) = (username, password) {
                    builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                }
                let transport = builder.build();
                transport.send(email).await.context("smtp send")?;
                Ok(())
            }
        }
    }
}

/// The HTTP-API wire shape: a single JSON POST.
pub fn http_payload(msg: &EmailMessage) -> Value {
    json!({
        "from": msg.from,
        "to": msg.to,
        "subject": msg.subject,
        "html": msg.html,
        "text": msg.text,
    })
}

/// Multipart alternative (text + HTML) message for SMTP.
pub fn build_message(msg: &EmailMessage) -> Result<Message> {
    let mut builder = Message::builder()
        .from(msg.from.parse().context("parse from address")?)
        .subject(msg.subject.clone());
    for to in &msg.to {
        builder = builder.to(to.parse().with_context(|| format!("parse recipient {to}"))?);
    }
    builder
        .multipart(MultiPart::alternative_plain_html(
            msg.text.clone(),
            msg.html.clone(),
        ))
        .context("assemble email")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> EmailMessage {
        EmailMessage {
            from: "Briefcast <digest@example.com>".into(),
            to: vec!["ops@example.com".into(), "desk@example.com".into()],
            subject: "Daily Brief — Friday, Jul 31".into(),
            html: "<p>hello</p>".into(),
            text: "hello\n".into(),
        }
    }

    #[test]
    fn http_payload_shape() {
        let v = http_payload(&fixture());
        assert_eq!(v["from"], "Briefcast <digest@example.com>");
        assert_eq!(v["to"].as_array().unwrap().len(), 2);
        assert_eq!(v["subject"], "Daily Brief — Friday, Jul 31");
        assert!(v["html"].as_str().unwrap().contains("<p>"));
        assert!(!v["text"].as_str().unwrap().contains("<p>"));
    }

    #[test]
    fn smtp_message_builds_with_display_name_and_multipart() {
        let email = build_message(&fixture()).unwrap();
        let rendered = String::from_utf8(email.formatted()).unwrap();
        assert!(rendered.contains("Subject: "));
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("ops@example.com"));
    }

    #[test]
    fn bad_recipient_is_an_error() {
        let mut msg = fixture();
        msg.to = vec!["not-an-address".into()];
        assert!(build_message(&msg).is_err());
    }
}
