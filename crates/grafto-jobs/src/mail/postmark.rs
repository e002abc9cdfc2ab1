//! Postmark template delivery.

use super::{MailError, Mailer, TemplatedMessage};
use async_trait::async_trait;
use grafto_config::MailConfig;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const TOKEN_HEADER: &str = "X-Postmark-Server-Token";

/// Sends templated mail through Postmark's `/email/withTemplate` endpoint.
pub struct PostmarkMailer {
    client: Client,
    base_url: String,
    server_token: String,
}

impl PostmarkMailer {
    /// Creates a mailer with its own HTTP client.
    pub fn new(base_url: &str, server_token: &str, timeout: Duration) -> Result<Self, MailError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url, server_token))
    }

    /// Creates a mailer around an existing client.
    pub fn with_client(client: Client, base_url: &str, server_token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            server_token: server_token.to_string(),
        }
    }

    /// Creates a mailer from the mail section of the configuration.
    pub fn from_config(config: &MailConfig) -> Result<Self, MailError> {
        let token = config
            .postmark_api_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MailError::InvalidMessage("Postmark API token not set".to_string()))?;

        Self::new(&config.postmark_base_url, token, config.timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    template_alias: &'a str,
    template_model: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkErrorResponse {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    message: String,
}

/// Adds the subject to the template model so templates can render it.
fn template_model(message: &TemplatedMessage) -> Value {
    match &message.payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.entry("subject")
                .or_insert_with(|| Value::String(message.subject.clone()));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "subject": message.subject }),
        other => other.clone(),
    }
}

#[async_trait]
impl Mailer for PostmarkMailer {
    async fn send(&self, message: &TemplatedMessage) -> Result<(), MailError> {
        message.validate()?;
        debug!(to = %message.to, template = %message.template, "Postmark send");

        let request = TemplateEmailRequest {
            from: &message.from,
            to: &message.to,
            template_alias: &message.template,
            template_model: template_model(message),
        };

        let response = self
            .client
            .post(self.url("/email/withTemplate"))
            .header(TOKEN_HEADER, &self.server_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<PostmarkErrorResponse>(&body) {
            Ok(err) => format!("{} (code {})", err.message, err.error_code),
            Err(_) => body,
        };

        Err(MailError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
