//! WhatsApp-Twilio Provider
//!
//! Stateless REST adapter for the hosted WhatsApp Business API. Inbound is a
//! poll loop with a lookback window and newest-SID de-duplication; outbound
//! goes through the Messages endpoint. Delivery status maps Twilio's status
//! strings into the normalised set.

pub(crate) mod client;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, TwilioEnv};
use crate::error::{RelayError, Result};
use crate::providers::{
    DeliveryState, DeliveryStatus, InboundMessage, ListenTuning, MediaAttachment, MediaContent,
    MediaKind, MessageHandler, Provider, ProviderCapabilities, ProviderKind, SendOptions,
    SendResult,
};
use crate::utils::{normalize_identifier, truncate_str};

use client::{TwilioClient, TwilioMessage};

/// Map Twilio's status string plus error fields into the normalised shape.
fn map_delivery(
    status: Option<&str>,
    error_code: Option<i64>,
    error_message: Option<&str>,
    timestamp_ms: i64,
) -> DeliveryStatus {
    let state = match status.unwrap_or("") {
        "sent" | "sending" | "queued" => DeliveryState::Sent,
        "delivered" => DeliveryState::Delivered,
        "read" => DeliveryState::Read,
        "failed" | "undelivered" | "canceled" => DeliveryState::Failed,
        _ => DeliveryState::Unknown,
    };
    let error = match (error_code, error_message) {
        (Some(code), Some(msg)) => Some(format!("{code}: {msg}")),
        (Some(code), None) => Some(format!("{code}: ")),
        (None, Some(msg)) => Some(msg.to_string()),
        (None, None) => None,
    };
    DeliveryStatus {
        state,
        timestamp_ms,
        error,
    }
}

/// Newest message seen by the poll loop, for de-duplication across
/// iterations. Messages older-or-equal are skipped.
#[derive(Debug, Clone, Default)]
struct PollCursor {
    newest_ms: i64,
    newest_sid: Option<String>,
}

impl PollCursor {
    fn is_new(&self, msg_ms: i64, sid: &str) -> bool {
        if msg_ms != self.newest_ms {
            return msg_ms > self.newest_ms;
        }
        // Same timestamp: only the cursor SID itself is a duplicate.
        self.newest_sid.as_deref() != Some(sid)
    }

    fn advance(&mut self, msg_ms: i64, sid: &str) {
        if msg_ms >= self.newest_ms {
            self.newest_ms = msg_ms;
            self.newest_sid = Some(sid.to_string());
        }
    }
}

pub struct TwilioProvider {
    caps: ProviderCapabilities,
    client: Arc<TwilioClient>,
    connected: AtomicBool,
    handler: std::sync::Mutex<Option<MessageHandler>>,
    listen_cancel: Mutex<Option<CancellationToken>>,
    listen_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TwilioProvider {
    pub fn new(_config: &Config) -> Result<Self> {
        let env = TwilioEnv::from_env().map_err(|issues| {
            RelayError::Config(format!(
                "wa-twilio environment problems:\n  - {}",
                issues.join("\n  - ")
            ))
        })?;
        Ok(Self {
            caps: ProviderCapabilities::for_kind(ProviderKind::WaTwilio),
            client: Arc::new(TwilioClient::new(env)?),
            connected: AtomicBool::new(false),
            handler: std::sync::Mutex::new(None),
            listen_cancel: Mutex::new(None),
            listen_task: Mutex::new(None),
        })
    }

    fn wire_to(&self, to: &str) -> Result<String> {
        let canonical = normalize_identifier(ProviderKind::WaTwilio, to)?;
        Ok(format!("whatsapp:{canonical}"))
    }

    /// One poll iteration: fetch, filter to fresh inbound, dispatch
    /// oldest-first, advance the cursor.
    async fn poll_once(
        client: &TwilioClient,
        cursor: &mut PollCursor,
        lookback: std::time::Duration,
        handler: &MessageHandler,
    ) -> Result<()> {
        let Some(own_wire) = client.env().whatsapp_from.clone() else {
            // Messaging-service setups receive via webhooks we do not host;
            // nothing to poll.
            return Ok(());
        };
        let since = chrono::Utc::now()
            - chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::seconds(600));

        let mut messages = client.list_inbound(&own_wire, since).await?;
        let cutoff_ms = since.timestamp_millis();

        // Oldest first preserves causal order within the iteration.
        messages.sort_by_key(|m| m.timestamp_ms().unwrap_or(0));

        for msg in messages {
            if !msg.is_inbound() {
                continue;
            }
            let ts = msg.timestamp_ms().unwrap_or(0);
            if ts < cutoff_ms || !cursor.is_new(ts, &msg.sid) {
                continue;
            }
            cursor.advance(ts, &msg.sid);

            match Self::to_inbound(client, &msg, ts).await {
                Some(inbound) => {
                    tracing::info!(
                        "wa-twilio: inbound {} from {}: {}",
                        inbound.id,
                        inbound.from,
                        truncate_str(&inbound.body, 50),
                    );
                    handler(inbound).await;
                }
                None => {
                    tracing::debug!("wa-twilio: skipping unaddressable message {}", msg.sid);
                }
            }
        }
        Ok(())
    }

    async fn to_inbound(
        client: &TwilioClient,
        msg: &TwilioMessage,
        timestamp_ms: i64,
    ) -> Option<InboundMessage> {
        let from = normalize_identifier(ProviderKind::WaTwilio, msg.from.as_deref()?).ok()?;
        let to = msg
            .to
            .as_deref()
            .and_then(|t| normalize_identifier(ProviderKind::WaTwilio, t).ok())
            .unwrap_or_default();

        let mut media = Vec::new();
        if msg.num_media.as_deref().is_some_and(|n| n != "0") {
            match client.list_media_urls(&msg.sid).await {
                Ok(urls) => {
                    for (url, content_type) in urls {
                        let kind = match content_type.as_deref() {
                            Some(ct) if ct.starts_with("image/") => MediaKind::Image,
                            Some(ct) if ct.starts_with("video/") => MediaKind::Video,
                            Some(ct) if ct.starts_with("audio/") => MediaKind::Voice,
                            _ => MediaKind::Document,
                        };
                        let mut attachment =
                            MediaAttachment::new(kind, MediaContent::Url(url));
                        attachment.mime = content_type;
                        media.push(attachment);
                    }
                }
                Err(e) => {
                    tracing::warn!("wa-twilio: media listing failed for {}: {e}", msg.sid);
                }
            }
        }

        Some(InboundMessage {
            id: msg.sid.clone(),
            from,
            to,
            body: msg.body.clone().unwrap_or_default(),
            timestamp_ms,
            sender_name: None,
            media,
            provider: ProviderKind::WaTwilio,
            group: None,
            raw: None,
        })
    }
}

#[async_trait]
impl Provider for TwilioProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WaTwilio
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    async fn initialize(&self) -> Result<()> {
        self.client.verify_credentials().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_listening().await?;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, to: &str, body: &str, options: SendOptions) -> Result<SendResult> {
        let to_wire = self.wire_to(to)?;

        let media_url = match options.media.first() {
            Some(attachment) => {
                self.caps.check_media_size(attachment.size)?;
                match &attachment.content {
                    MediaContent::Url(url) => Some(url.clone()),
                    _ => {
                        return Ok(SendResult::failed(
                            "wa-twilio only attaches media by URL",
                        ))
                    }
                }
            }
            None => None,
        };

        match self
            .client
            .send_message(&to_wire, body, media_url.as_deref())
            .await
        {
            Ok(msg) => {
                let queued = msg.status.as_deref() == Some("queued");
                let mut result = if queued {
                    SendResult::queued(msg.sid.clone())
                } else {
                    SendResult::sent(msg.sid.clone())
                };
                result = result.with_meta("sid", msg.sid);
                Ok(result)
            }
            Err(RelayError::RemoteRejected(reason)) => Ok(SendResult::failed(reason)),
            Err(RelayError::Transport { message, .. }) => Ok(SendResult::failed(message)),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, _to: &str) {
        // The REST API has no typing indicator; deliberately a no-op.
    }

    async fn delivery_status(&self, message_id: &str) -> DeliveryStatus {
        match self.client.fetch_message(message_id).await {
            Ok(msg) => map_delivery(
                msg.status.as_deref(),
                msg.error_code,
                msg.error_message.as_deref(),
                msg.timestamp_ms()
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            ),
            Err(e) => {
                tracing::debug!("wa-twilio: status fetch for {message_id} failed: {e}");
                DeliveryStatus::unknown_now()
            }
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }

    async fn start_listening(
        &self,
        cancel: CancellationToken,
        tuning: &ListenTuning,
    ) -> Result<()> {
        if self.listen_task.lock().await.is_some() {
            return Ok(());
        }
        let Some(handler) = self.handler.lock().expect("handler lock").clone() else {
            return Err(RelayError::Internal(
                "start_listening before on_message".into(),
            ));
        };

        let listen_cancel = cancel.child_token();
        *self.listen_cancel.lock().await = Some(listen_cancel.clone());

        let client = self.client.clone();
        let interval = tuning.poll_interval;
        let lookback = tuning.lookback;
        let task = tokio::spawn(async move {
            let mut cursor = PollCursor::default();
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                "wa-twilio: polling every {:?} with a {:?} lookback",
                interval,
                lookback
            );
            loop {
                tokio::select! {
                    _ = listen_cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                // A failing iteration is logged and the loop carries on.
                if let Err(e) =
                    Self::poll_once(&client, &mut cursor, lookback, &handler).await
                {
                    tracing::warn!("wa-twilio: poll iteration failed: {e}");
                }
            }
            tracing::debug!("wa-twilio: poll loop stopped");
        });
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        if let Some(cancel) = self.listen_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.listen_task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        self.client.verify_credentials().await.is_ok()
    }

    async fn login(&self) -> Result<()> {
        self.client.verify_credentials().await?;
        tracing::info!("wa-twilio: credentials verified");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        // Credentials live in the environment; there is no server-side
        // session to revoke or local state to erase.
        tracing::info!("wa-twilio: nothing to log out — unset the TWILIO_* variables");
        Ok(())
    }

    async fn session_id(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mapping_sent_family() {
        for s in ["sent", "sending", "queued"] {
            assert_eq!(map_delivery(Some(s), None, None, 0).state, DeliveryState::Sent);
        }
    }

    #[test]
    fn test_delivery_mapping_terminal_states() {
        assert_eq!(
            map_delivery(Some("delivered"), None, None, 0).state,
            DeliveryState::Delivered
        );
        assert_eq!(
            map_delivery(Some("read"), None, None, 0).state,
            DeliveryState::Read
        );
        for s in ["failed", "undelivered", "canceled"] {
            assert_eq!(
                map_delivery(Some(s), None, None, 0).state,
                DeliveryState::Failed
            );
        }
    }

    #[test]
    fn test_delivery_mapping_unknown() {
        assert_eq!(
            map_delivery(Some("accepted"), None, None, 0).state,
            DeliveryState::Unknown
        );
        assert_eq!(map_delivery(None, None, None, 0).state, DeliveryState::Unknown);
    }

    #[test]
    fn test_delivery_error_formatting() {
        let st = map_delivery(Some("failed"), Some(63016), Some("template required"), 0);
        assert_eq!(st.error.as_deref(), Some("63016: template required"));
    }

    #[test]
    fn test_cursor_skips_older_or_equal() {
        let mut cursor = PollCursor::default();
        assert!(cursor.is_new(1000, "SM1"));
        cursor.advance(1000, "SM1");

        assert!(!cursor.is_new(900, "SM0"), "older must be skipped");
        assert!(!cursor.is_new(1000, "SM1"), "the cursor itself is a dup");
        assert!(cursor.is_new(1000, "SM2"), "same instant, different SID");
        assert!(cursor.is_new(1100, "SM3"));
    }

    #[test]
    fn test_cursor_advance_keeps_newest() {
        let mut cursor = PollCursor::default();
        cursor.advance(2000, "SMb");
        cursor.advance(1000, "SMa");
        assert_eq!(cursor.newest_ms, 2000);
        assert_eq!(cursor.newest_sid.as_deref(), Some("SMb"));
    }
}
