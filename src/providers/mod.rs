//! Provider Abstraction
//!
//! Three dissimilar messaging backends (WhatsApp Web protocol, WhatsApp
//! Business over Twilio REST, Telegram MTProto) behind one contract: a
//! normalised inbound message type, one send shape, and a static capability
//! record per kind. The relay supervisor and auto-reply engine only ever see
//! `Arc<dyn Provider>`.

pub mod message;
pub mod telegram;
pub mod twilio;
pub mod waweb;

pub use message::{
    DeliveryState, DeliveryStatus, GroupContext, InboundMessage, MediaAttachment, MediaContent,
    MediaKind, SendOptions, SendResult, SendStatus,
};
pub use waweb::reconnect::ReconnectPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{RelayError, Result};

/// Which backend a provider speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    WaWeb,
    WaTwilio,
    Telegram,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::WaWeb, Self::WaTwilio, Self::Telegram];

    /// Short tag used in config, CLI flags, and logs.
    pub fn tag(self) -> &'static str {
        match self {
            Self::WaWeb => "wa-web",
            Self::WaTwilio => "wa-twilio",
            Self::Telegram => "telegram",
        }
    }

    /// Long form for user-facing text ("{{PROVIDERS}}" expansion, status).
    pub fn detailed_name(self) -> &'static str {
        match self {
            Self::WaWeb => "WhatsApp Web",
            Self::WaTwilio => "WhatsApp (Twilio)",
            Self::Telegram => "Telegram",
        }
    }

    /// Messenger brand name for the agent identity prompt.
    pub fn messenger_name(self) -> &'static str {
        match self {
            Self::WaWeb | Self::WaTwilio => "WhatsApp",
            Self::Telegram => "Telegram",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ProviderKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "wa-web" => Ok(Self::WaWeb),
            "wa-twilio" => Ok(Self::WaTwilio),
            "telegram" => Ok(Self::Telegram),
            // Legacy aliases from earlier releases.
            "web" => {
                tracing::warn!("provider name \"web\" is deprecated, use \"wa-web\"");
                Ok(Self::WaWeb)
            }
            "twilio" => {
                tracing::warn!("provider name \"twilio\" is deprecated, use \"wa-twilio\"");
                Ok(Self::WaTwilio)
            }
            other => Err(RelayError::Config(format!(
                "unknown provider {other:?} (expected wa-web, wa-twilio, or telegram)"
            ))),
        }
    }
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Telegram's media ceiling, overridable via `TELEGRAM_MAX_MEDIA_MB` in whole
/// megabytes. Invalid values fall back with a warning; anything above 2 GiB
/// is clamped.
fn telegram_media_cap() -> u64 {
    const DEFAULT: u64 = 2 * GIB;
    let Ok(raw) = std::env::var("TELEGRAM_MAX_MEDIA_MB") else {
        return DEFAULT;
    };
    match raw.trim().parse::<u64>() {
        Ok(mb) if mb > 0 => {
            let bytes = mb * MIB;
            if bytes > DEFAULT {
                tracing::warn!("TELEGRAM_MAX_MEDIA_MB={mb} exceeds 2048, clamping to 2 GiB");
                DEFAULT
            } else {
                bytes
            }
        }
        _ => {
            tracing::warn!(
                "TELEGRAM_MAX_MEDIA_MB={raw:?} is not a positive integer, using 2 GiB"
            );
            DEFAULT
        }
    }
}

/// Static feature record for one backend.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub delivery_receipts: bool,
    pub read_receipts: bool,
    pub typing_indicator: bool,
    pub reactions: bool,
    pub replies: bool,
    pub editing: bool,
    pub deleting: bool,
    pub can_initiate_conversation: bool,
    pub max_media_size: u64,
    /// MIME patterns the backend accepts, `*` wildcards allowed.
    pub accepted_media: Vec<&'static str>,
}

impl ProviderCapabilities {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::WaWeb => Self {
                delivery_receipts: false,
                read_receipts: false,
                typing_indicator: true,
                reactions: true,
                replies: true,
                editing: false,
                deleting: true,
                can_initiate_conversation: true,
                max_media_size: 64 * MIB,
                accepted_media: vec!["image/*", "video/*", "audio/*", "application/*"],
            },
            ProviderKind::WaTwilio => Self {
                delivery_receipts: true,
                read_receipts: true,
                typing_indicator: false,
                reactions: false,
                replies: false,
                editing: false,
                deleting: false,
                can_initiate_conversation: false,
                max_media_size: 5 * MIB,
                accepted_media: vec![
                    "image/jpeg",
                    "image/png",
                    "audio/ogg",
                    "video/mp4",
                    "application/pdf",
                ],
            },
            ProviderKind::Telegram => Self {
                delivery_receipts: false,
                read_receipts: false,
                typing_indicator: true,
                reactions: true,
                replies: true,
                editing: true,
                deleting: true,
                can_initiate_conversation: true,
                max_media_size: telegram_media_cap(),
                accepted_media: vec!["*/*"],
            },
        }
    }

    /// Pre-flight media size check shared by all providers.
    pub fn check_media_size(&self, declared: Option<u64>) -> Result<()> {
        if let Some(size) = declared {
            if size > self.max_media_size {
                return Err(RelayError::RemoteRejected(format!(
                    "media of {size} bytes exceeds the provider limit of {} bytes",
                    self.max_media_size
                )));
            }
        }
        Ok(())
    }
}

/// Handler installed by the auto-reply engine. Exactly one per provider.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A provider giving up for good (auth revoked, reconnect attempts
/// exhausted). The supervisor logs it and keeps the other providers running.
#[derive(Debug, Clone)]
pub struct ProviderFatal {
    pub kind: ProviderKind,
    pub message: String,
}

/// Per-provider tuning carried from the CLI into `start_listening`.
#[derive(Clone)]
pub struct ListenTuning {
    /// Twilio poll cadence.
    pub poll_interval: Duration,
    /// Twilio lookback window per poll.
    pub lookback: Duration,
    /// WhatsApp-Web reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// WhatsApp-Web keepalive ping cadence, when enabled.
    pub web_heartbeat: Option<Duration>,
    /// Where a provider reports that it is terminating for good.
    pub fatal: Option<tokio::sync::mpsc::UnboundedSender<ProviderFatal>>,
}

impl Default for ListenTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            lookback: Duration::from_secs(600),
            reconnect: ReconnectPolicy::default(),
            web_heartbeat: None,
            fatal: None,
        }
    }
}

impl ListenTuning {
    /// Report a fatal condition to the supervisor, if one is listening.
    pub fn report_fatal(&self, kind: ProviderKind, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{kind}: fatal: {message}");
        if let Some(ref tx) = self.fatal {
            let _ = tx.send(ProviderFatal { kind, message });
        }
    }
}

/// The provider contract. See the module docs; semantics that matter:
///
/// - `send` shapes backend refusals into a failed [`SendResult`] rather than
///   an `Err`. `Err` is reserved for local misuse (unresolvable target,
///   oversized media) and transport failure.
/// - `send_typing` never fails, whatever the backend thinks of it.
/// - `stop_listening` is idempotent and waits for in-flight handler
///   invocations, including their cleanup closures.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> &ProviderCapabilities;

    /// Validate configuration and prepare the client. Must not block on
    /// network I/O beyond a short handshake.
    async fn initialize(&self) -> Result<()>;

    /// Side-effect-free status probe.
    async fn is_connected(&self) -> bool;

    /// Idempotent; safe to call after a failed `initialize`.
    async fn disconnect(&self) -> Result<()>;

    async fn send(&self, to: &str, body: &str, options: SendOptions) -> Result<SendResult>;

    async fn send_typing(&self, to: &str);

    async fn delivery_status(&self, message_id: &str) -> DeliveryStatus;

    /// Register the single inbound handler. Replaces any previous one.
    fn on_message(&self, handler: MessageHandler);

    /// Start the background subscription. Returns once the subscription is
    /// established; inbound messages flow to the registered handler until
    /// `cancel` fires or `stop_listening` is called.
    async fn start_listening(&self, cancel: CancellationToken, tuning: &ListenTuning)
        -> Result<()>;

    async fn stop_listening(&self) -> Result<()>;

    async fn is_authenticated(&self) -> bool;

    /// Drive the kind's interactive flow: QR scan (wa-web), phone + code +
    /// password (telegram), credential verification (wa-twilio).
    async fn login(&self) -> Result<()>;

    /// Revoke server-side and erase local state.
    async fn logout(&self) -> Result<()>;

    /// Stable identifier of the locally stored auth session, if any.
    async fn session_id(&self) -> Option<String>;
}

/// Create an uninitialised provider for a kind. Fails only on invalid
/// configuration shape, never on network state.
pub fn create_provider(kind: ProviderKind, config: &Config) -> Result<Arc<dyn Provider>> {
    match kind {
        ProviderKind::WaWeb => Ok(Arc::new(waweb::WaWebProvider::new(config)?)),
        ProviderKind::WaTwilio => Ok(Arc::new(twilio::TwilioProvider::new(config)?)),
        ProviderKind::Telegram => Ok(Arc::new(telegram::TelegramProvider::new(config)?)),
    }
}

/// Create and initialise in one step.
pub async fn connect_provider(kind: ProviderKind, config: &Config) -> Result<Arc<dyn Provider>> {
    let provider = create_provider(kind, config)?;
    provider.initialize().await?;
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_canonical() {
        assert_eq!("wa-web".parse::<ProviderKind>().unwrap(), ProviderKind::WaWeb);
        assert_eq!(
            "wa-twilio".parse::<ProviderKind>().unwrap(),
            ProviderKind::WaTwilio
        );
        assert_eq!(
            "telegram".parse::<ProviderKind>().unwrap(),
            ProviderKind::Telegram
        );
    }

    #[test]
    fn test_kind_parse_legacy_aliases() {
        assert_eq!("web".parse::<ProviderKind>().unwrap(), ProviderKind::WaWeb);
        assert_eq!(
            "twilio".parse::<ProviderKind>().unwrap(),
            ProviderKind::WaTwilio
        );
    }

    #[test]
    fn test_kind_parse_unknown_fails() {
        assert!("signal".parse::<ProviderKind>().is_err());
        assert!("".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_kind_display_round_trips() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.tag().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_capability_caps() {
        assert_eq!(
            ProviderCapabilities::for_kind(ProviderKind::WaTwilio).max_media_size,
            5 * MIB
        );
        assert_eq!(
            ProviderCapabilities::for_kind(ProviderKind::WaWeb).max_media_size,
            64 * MIB
        );
    }

    #[test]
    fn test_check_media_size() {
        let caps = ProviderCapabilities::for_kind(ProviderKind::WaTwilio);
        assert!(caps.check_media_size(None).is_ok());
        assert!(caps.check_media_size(Some(MIB)).is_ok());
        assert!(caps.check_media_size(Some(6 * MIB)).is_err());
    }

    #[test]
    fn test_messenger_names() {
        assert_eq!(ProviderKind::WaWeb.messenger_name(), "WhatsApp");
        assert_eq!(ProviderKind::WaTwilio.messenger_name(), "WhatsApp");
        assert_eq!(ProviderKind::Telegram.messenger_name(), "Telegram");
        assert_eq!(ProviderKind::WaTwilio.detailed_name(), "WhatsApp (Twilio)");
    }
}
