//! Thin Twilio REST client for the WhatsApp Business channel.
//!
//! Only the three calls the provider needs: send a message, list recent
//! inbound messages, fetch one message for delivery status. Everything else
//! about the wire protocol stays inside Twilio.

use serde::Deserialize;
use std::time::Duration;

use crate::config::{TwilioAuth, TwilioEnv};
use crate::error::{RelayError, Result};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
pub struct TwilioMessage {
    pub sid: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    /// RFC 2822, e.g. `Mon, 16 Jun 2025 14:00:00 +0000`.
    #[serde(default)]
    pub date_sent: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub num_media: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TwilioMessage {
    /// Sent timestamp in unix milliseconds, falling back to created.
    pub fn timestamp_ms(&self) -> Option<i64> {
        let raw = self.date_sent.as_deref().or(self.date_created.as_deref())?;
        chrono::DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    pub fn is_inbound(&self) -> bool {
        self.direction.as_deref() == Some("inbound")
    }
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<TwilioMessage>,
}

#[derive(Debug, Deserialize)]
struct MediaItem {
    sid: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    media_list: Vec<MediaItem>,
}

pub struct TwilioClient {
    http: reqwest::Client,
    env: TwilioEnv,
}

impl TwilioClient {
    pub fn new(env: TwilioEnv) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::transport_with("http client build failed", e))?;
        Ok(Self { http, env })
    }

    pub fn env(&self) -> &TwilioEnv {
        &self.env
    }

    fn credentials(&self) -> (&str, &str) {
        match &self.env.auth {
            TwilioAuth::AuthToken(token) => (self.env.account_sid.as_str(), token.as_str()),
            TwilioAuth::ApiKey { key, secret } => (key.as_str(), secret.as_str()),
        }
    }

    fn messages_url(&self) -> String {
        format!("{API_BASE}/Accounts/{}/Messages.json", self.env.account_sid)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let (user, pass) = self.credentials();
        let response = self
            .http
            .get(url)
            .basic_auth(user, Some(pass))
            .query(query)
            .send()
            .await
            .map_err(|e| RelayError::transport_with("twilio request failed", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RelayError::Auth("twilio rejected the credentials".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::transport(format!(
                "twilio returned {status}: {body}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RelayError::transport_with("twilio response parse failed", e))
    }

    /// Verify the credentials with a cheap authenticated request.
    pub async fn verify_credentials(&self) -> Result<()> {
        let url = format!(
            "{API_BASE}/Accounts/{}.json",
            self.env.account_sid
        );
        self.get_json::<serde_json::Value>(&url, &[]).await?;
        Ok(())
    }

    /// List messages addressed to our WhatsApp number since `date_sent_after`
    /// (UTC date granularity on the server, exact filtering is the caller's).
    pub async fn list_inbound(
        &self,
        to_wire: &str,
        date_sent_after: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<TwilioMessage>> {
        let page: MessagePage = self
            .get_json(
                &self.messages_url(),
                &[
                    ("To", to_wire.to_string()),
                    (
                        "DateSent>",
                        date_sent_after.format("%Y-%m-%d").to_string(),
                    ),
                    ("PageSize", "50".to_string()),
                ],
            )
            .await?;
        Ok(page.messages)
    }

    pub async fn fetch_message(&self, sid: &str) -> Result<TwilioMessage> {
        let url = format!(
            "{API_BASE}/Accounts/{}/Messages/{sid}.json",
            self.env.account_sid
        );
        self.get_json(&url, &[]).await
    }

    /// Public media URLs for an inbound message.
    pub async fn list_media_urls(&self, message_sid: &str) -> Result<Vec<(String, Option<String>)>> {
        let url = format!(
            "{API_BASE}/Accounts/{}/Messages/{message_sid}/Media.json",
            self.env.account_sid
        );
        let page: MediaPage = self.get_json(&url, &[]).await?;
        Ok(page
            .media_list
            .into_iter()
            .map(|item| {
                (
                    format!(
                        "{API_BASE}/Accounts/{}/Messages/{message_sid}/Media/{}",
                        self.env.account_sid, item.sid
                    ),
                    item.content_type,
                )
            })
            .collect())
    }

    /// Send a message. `media_url` attaches media by URL, the only form the
    /// REST API accepts.
    pub async fn send_message(
        &self,
        to_wire: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<TwilioMessage> {
        let mut form: Vec<(&str, String)> = vec![("To", to_wire.to_string())];
        if !body.is_empty() {
            form.push(("Body", body.to_string()));
        }
        if let Some(url) = media_url {
            form.push(("MediaUrl", url.to_string()));
        }
        // Sender and messaging service are mutually exclusive; the service
        // wins when both are configured.
        if let Some(ref sid) = self.env.sender_sid {
            form.push(("MessagingServiceSid", sid.clone()));
        } else if let Some(ref from) = self.env.whatsapp_from {
            form.push(("From", from.clone()));
        } else {
            return Err(RelayError::Config(
                "neither TWILIO_WHATSAPP_FROM nor TWILIO_SENDER_SID is set".into(),
            ));
        }

        let (user, pass) = self.credentials();
        let response = self
            .http
            .post(self.messages_url())
            .basic_auth(user, Some(pass))
            .form(&form)
            .send()
            .await
            .map_err(|e| RelayError::transport_with("twilio send failed", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RelayError::Auth("twilio rejected the credentials".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::RemoteRejected(format!(
                "twilio returned {status}: {body}"
            )));
        }
        response
            .json::<TwilioMessage>()
            .await
            .map_err(|e| RelayError::transport_with("twilio response parse failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parse_rfc2822() {
        let msg = TwilioMessage {
            sid: "SM1".into(),
            from: None,
            to: None,
            body: None,
            status: None,
            direction: None,
            date_sent: Some("Mon, 16 Jun 2025 14:00:00 +0000".into()),
            date_created: None,
            num_media: None,
            error_code: None,
            error_message: None,
        };
        assert_eq!(msg.timestamp_ms(), Some(1_750_082_400_000));
    }

    #[test]
    fn test_inbound_direction() {
        let mut msg = TwilioMessage {
            sid: "SM1".into(),
            from: None,
            to: None,
            body: None,
            status: None,
            direction: Some("inbound".into()),
            date_sent: None,
            date_created: None,
            num_media: None,
            error_code: None,
            error_message: None,
        };
        assert!(msg.is_inbound());
        msg.direction = Some("outbound-api".into());
        assert!(!msg.is_inbound());
    }

    #[test]
    fn test_message_page_parses_twilio_shape() {
        let json = r#"{
            "messages": [
                {"sid": "SM123", "from": "whatsapp:+15551234567",
                 "to": "whatsapp:+15550000000", "body": "hi",
                 "status": "received", "direction": "inbound",
                 "date_sent": "Mon, 16 Jun 2025 14:00:00 +0000",
                 "num_media": "0"}
            ]
        }"#;
        let page: MessagePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].sid, "SM123");
    }
}
