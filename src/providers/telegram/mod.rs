//! Telegram Provider
//!
//! A user-account MTProto client via `grammers`. Credentials are the
//! `TELEGRAM_API_ID`/`TELEGRAM_API_HASH` pair plus a session token persisted
//! at `<config>/telegram/session/session.string`. Inbound subscribes to new
//! message updates, downloads media in-process, and degrades gracefully when
//! a download fails. Outbound URL media is staged through the temp store
//! with size enforcement before and during the transfer.

pub(crate) mod login;
pub(crate) mod media;

use async_trait::async_trait;
use base64::Engine;
use grammers_client::types::{Chat, Media};
use grammers_client::{Client, Config as ClientConfig, InitParams, InputMessage, Update};
use grammers_session::Session;
use grammers_tl_types as tl;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{paths, Config, TelegramEnv};
use crate::error::{RelayError, Result};
use crate::media::{TempStore, ORPHAN_TTL};
use crate::providers::{
    DeliveryStatus, InboundMessage, ListenTuning, MediaAttachment, MediaContent, MediaKind,
    MessageHandler, Provider, ProviderCapabilities, ProviderKind, SendOptions, SendResult,
};
use crate::utils::truncate_str;

pub struct TelegramProvider {
    caps: ProviderCapabilities,
    env: TelegramEnv,
    session_path: PathBuf,
    legacy_session_path: PathBuf,
    temp: TempStore,
    client: Mutex<Option<Client>>,
    handler: std::sync::Mutex<Option<MessageHandler>>,
    connected: Arc<AtomicBool>,
    listen_cancel: Mutex<Option<CancellationToken>>,
    listen_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelegramProvider {
    pub fn new(_config: &Config) -> Result<Self> {
        let env = TelegramEnv::from_env().map_err(|issues| {
            RelayError::Config(format!(
                "telegram environment problems:\n  - {}",
                issues.join("\n  - ")
            ))
        })?;
        Ok(Self {
            caps: ProviderCapabilities::for_kind(ProviderKind::Telegram),
            env,
            session_path: paths::telegram_session_file(),
            legacy_session_path: paths::telegram_legacy_session_file(),
            temp: TempStore::for_telegram(),
            client: Mutex::new(None),
            handler: std::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            listen_cancel: Mutex::new(None),
            listen_task: Mutex::new(None),
        })
    }

    /// Whether a persisted session token exists. Used by auto-detection.
    pub fn session_present() -> bool {
        paths::telegram_session_file().exists()
    }

    /// Load the persisted session token (UTF-8 base64, trimmed on load), or
    /// a fresh session when none exists.
    fn load_session(&self) -> Result<Session> {
        if !self.session_path.exists() {
            return Ok(Session::new());
        }
        let raw = std::fs::read_to_string(&self.session_path)
            .map_err(|e| RelayError::transport_with("cannot read session.string", e))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| RelayError::Auth(format!("session.string is corrupt: {e}")))?;
        Session::load(&bytes).map_err(|e| RelayError::Auth(format!("session token invalid: {e}")))
    }

    fn persist_session(&self, client: &Client) -> Result<()> {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(client.session().save());
        if let Some(parent) = self.session_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::transport_with("cannot create session dir", e))?;
        }
        std::fs::write(&self.session_path, encoded)
            .map_err(|e| RelayError::transport_with("cannot write session.string", e))?;
        Ok(())
    }

    async fn connect_client(&self) -> Result<Client> {
        if let Some(client) = self.client.lock().await.clone() {
            return Ok(client);
        }
        let session = self.load_session()?;
        let client = Client::connect(ClientConfig {
            session,
            api_id: self.env.api_id,
            api_hash: self.env.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| RelayError::transport(format!("telegram connect failed: {e}")))?;

        self.connected.store(true, Ordering::SeqCst);
        *self.client.lock().await = Some(client.clone());
        Ok(client)
    }

    /// Resolve a send target into a chat. Accepts `@username`, E.164 phone,
    /// or a decimal user id, with an optional `telegram:` prefix; an
    /// unresolvable raw form is retried once with `@`.
    async fn resolve_target(&self, client: &Client, to: &str) -> Result<Chat> {
        let raw = to.trim().strip_prefix("telegram:").unwrap_or(to.trim());
        if raw.is_empty() {
            return Err(RelayError::NotFound("empty telegram target".into()));
        }

        if let Some(chat) = self.try_resolve(client, raw).await? {
            return Ok(chat);
        }
        if !raw.starts_with('@') {
            let retried = format!("@{raw}");
            if let Some(chat) = self.try_resolve(client, &retried).await? {
                return Ok(chat);
            }
        }
        Err(RelayError::NotFound(format!(
            "telegram entity {to:?} could not be resolved"
        )))
    }

    async fn try_resolve(&self, client: &Client, target: &str) -> Result<Option<Chat>> {
        if let Some(username) = target.strip_prefix('@') {
            return client
                .resolve_username(&username.to_lowercase())
                .await
                .map_err(|e| RelayError::transport(format!("username lookup failed: {e}")));
        }

        // Phone numbers and numeric ids are matched against the dialog list.
        let by_phone = target.strip_prefix('+');
        let by_id: Option<i64> = target.parse().ok();
        if by_phone.is_none() && by_id.is_none() {
            return Ok(None);
        }

        let mut dialogs = client.iter_dialogs();
        loop {
            let dialog = dialogs
                .next()
                .await
                .map_err(|e| RelayError::transport(format!("dialog listing failed: {e}")))?;
            let Some(dialog) = dialog else { break };
            if let Chat::User(user) = dialog.chat() {
                if let Some(id) = by_id {
                    if user.id() == id {
                        return Ok(Some(dialog.chat().clone()));
                    }
                }
                if let Some(phone) = by_phone {
                    if user.phone().is_some_and(|p| p.trim_start_matches('+') == phone) {
                        return Ok(Some(dialog.chat().clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Canonical identifier for a sender: `@username`, `+phone`, decimal id,
    /// or `unknown`.
    fn sender_identifier(chat: Option<&Chat>) -> String {
        match chat {
            Some(Chat::User(user)) => {
                if let Some(username) = user.username() {
                    format!("@{}", username.to_lowercase())
                } else if let Some(phone) = user.phone() {
                    format!("+{}", phone.trim_start_matches('+'))
                } else {
                    user.id().to_string()
                }
            }
            Some(other) => other.id().to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Stage an outbound attachment on disk, enforcing the media cap, and
    /// send it. The staged temp file is released on every path.
    async fn send_media(
        &self,
        client: &Client,
        chat: &Chat,
        attachment: &MediaAttachment,
        caption: &str,
    ) -> Result<i32> {
        self.caps.check_media_size(attachment.size)?;

        // Either a caller-provided path or a staged temp file that must be
        // released when the send settles.
        let (path, staged) = match &attachment.content {
            MediaContent::Path(p) => (p.clone(), None),
            MediaContent::Url(url) => {
                let handle = self.temp.download_url(url, self.caps.max_media_size).await?;
                (handle.path().to_path_buf(), Some(handle))
            }
            MediaContent::Bytes(bytes) => {
                self.caps.check_media_size(Some(bytes.len() as u64))?;
                tokio::fs::create_dir_all(self.temp.dir())
                    .await
                    .map_err(|e| RelayError::transport_with("cannot create temp dir", e))?;
                let path = self
                    .temp
                    .dir()
                    .join(format!("telegram-dl-{}.tmp", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| RelayError::transport_with("cannot stage media bytes", e))?;
                let handle = crate::media::DownloadHandle::adopt(path.clone(), bytes.len() as u64);
                (path, Some(handle))
            }
        };

        if let Ok(meta) = tokio::fs::metadata(&path).await {
            self.caps.check_media_size(Some(meta.len()))?;
        }

        let uploaded = client
            .upload_file(&path)
            .await
            .map_err(|e| RelayError::transport(format!("telegram upload failed: {e}")))?;

        let input = match attachment.kind {
            MediaKind::Image => InputMessage::text(caption).photo(uploaded),
            _ => InputMessage::text(caption).document(uploaded),
        };
        let sent = client
            .send_message(chat, input)
            .await
            .map_err(|e| RelayError::transport(format!("telegram send failed: {e}")))?;

        if let Some(handle) = staged {
            handle.release();
        }
        Ok(sent.id())
    }

    /// Build and dispatch one inbound update. Downloads are deleted after
    /// the handler (and its cleanup) completes.
    async fn dispatch_message(
        client: &Client,
        temp: &TempStore,
        handler: &MessageHandler,
        message: grammers_client::types::Message,
    ) {
        if message.outgoing() {
            return;
        }

        let sender = message.sender();
        let from = Self::sender_identifier(sender.as_ref());
        let sender_name = sender.as_ref().and_then(|chat| match chat {
            Chat::User(user) => Some(user.full_name()),
            _ => None,
        });

        let mut attachments: Vec<MediaAttachment> = Vec::new();
        let mut temp_paths = Vec::new();
        if let Some(media) = message.media() {
            if matches!(media, Media::Photo(_) | Media::Document(_)) {
                if let Some((attachment, path)) =
                    media::download_inbound(client, &media, temp).await
                {
                    attachments.push(attachment);
                    temp_paths.push(path);
                }
            }
        }

        let body = message.text().to_string();
        if body.is_empty() && attachments.is_empty() {
            return;
        }

        let inbound = InboundMessage {
            id: message.id().to_string(),
            from: from.clone(),
            to: String::new(),
            body,
            timestamp_ms: message.date().timestamp_millis(),
            sender_name,
            media: attachments,
            provider: ProviderKind::Telegram,
            group: None,
            raw: None,
        };
        tracing::debug!(
            "telegram: inbound {} from {}: {}",
            inbound.id,
            from,
            truncate_str(&inbound.body, 50),
        );
        handler(inbound).await;

        for path in temp_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("telegram: temp cleanup failed for {}: {e}", path.display());
                }
            }
        }
    }
}

#[async_trait]
impl Provider for TelegramProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Telegram
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    async fn initialize(&self) -> Result<()> {
        // Orphans from crashed runs are swept before any new staging.
        self.temp.sweep_orphans(ORPHAN_TTL);
        self.connect_client().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_listening().await?;
        if let Some(client) = self.client.lock().await.take() {
            // Persist any session key rotation before dropping the handle.
            if let Err(e) = self.persist_session(&client) {
                tracing::warn!("telegram: session persist on disconnect failed: {e}");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, to: &str, body: &str, options: SendOptions) -> Result<SendResult> {
        let client = self.connect_client().await?;
        let chat = self.resolve_target(&client, to).await?;

        if options.typing {
            self.send_typing(to).await;
        }

        let outcome: Result<i32> = if let Some(attachment) = options.media.first() {
            self.send_media(&client, &chat, attachment, body).await
        } else {
            let mut input = InputMessage::text(body);
            if let Some(ref reply_to) = options.reply_to {
                if let Ok(id) = reply_to.parse::<i32>() {
                    input = input.reply_to(Some(id));
                }
            }
            client
                .send_message(&chat, input)
                .await
                .map(|m| m.id())
                .map_err(|e| RelayError::transport(format!("telegram send failed: {e}")))
        };

        match outcome {
            Ok(id) => Ok(SendResult::sent(id.to_string()).with_meta("user_id", chat.id().to_string())),
            Err(RelayError::Transport { message, .. }) => Ok(SendResult::failed(message)),
            Err(RelayError::RemoteRejected(message)) => Ok(SendResult::failed(message)),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, to: &str) {
        let Ok(client) = self.connect_client().await else {
            return;
        };
        let Ok(chat) = self.resolve_target(&client, to).await else {
            return;
        };
        let request = tl::functions::messages::SetTyping {
            peer: chat.pack().to_input_peer(),
            top_msg_id: None,
            action: tl::enums::SendMessageAction::Typing(tl::types::SendMessageTypingAction {}),
        };
        if let Err(e) = client.invoke(&request).await {
            tracing::debug!("telegram: typing indicator failed: {e}");
        }
    }

    async fn delivery_status(&self, _message_id: &str) -> DeliveryStatus {
        // MTProto exposes no reliable write-through acknowledgement.
        DeliveryStatus::unknown_now()
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }

    async fn start_listening(
        &self,
        cancel: CancellationToken,
        _tuning: &ListenTuning,
    ) -> Result<()> {
        if self.listen_task.lock().await.is_some() {
            return Ok(());
        }
        let Some(handler) = self.handler.lock().expect("handler lock").clone() else {
            return Err(RelayError::Internal(
                "start_listening before on_message".into(),
            ));
        };
        let client = self.connect_client().await?;
        if !client
            .is_authorized()
            .await
            .map_err(|e| RelayError::transport(format!("authorization probe failed: {e}")))?
        {
            return Err(RelayError::Auth(
                "telegram session is not authorized — run `warelay login --provider telegram`"
                    .into(),
            ));
        }

        let listen_cancel = cancel.child_token();
        *self.listen_cancel.lock().await = Some(listen_cancel.clone());

        let temp = self.temp.clone();
        let connected = self.connected.clone();
        let task = tokio::spawn(async move {
            tracing::info!("telegram: listening for updates");
            loop {
                let update = tokio::select! {
                    _ = listen_cancel.cancelled() => break,
                    update = client.next_update() => update,
                };
                match update {
                    Ok(Update::NewMessage(message)) => {
                        Self::dispatch_message(&client, &temp, &handler, message).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("telegram: update stream error: {e}");
                        tokio::select! {
                            _ = listen_cancel.cancelled() => break,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                        }
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            tracing::debug!("telegram: update loop stopped");
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
        if let Some(client) = self.client.lock().await.clone() {
            return client.is_authorized().await.unwrap_or(false);
        }
        self.session_path.exists()
    }

    async fn login(&self) -> Result<()> {
        let client = self.connect_client().await?;
        if client
            .is_authorized()
            .await
            .map_err(|e| RelayError::transport(format!("authorization probe failed: {e}")))?
        {
            tracing::info!("telegram: already signed in");
            return Ok(());
        }

        match login::interactive_sign_in(&client).await {
            Ok(()) => {
                self.persist_session(&client)?;
                tracing::info!(
                    "telegram: session stored at {}",
                    self.session_path.display()
                );
                Ok(())
            }
            Err(e) => {
                // A failed login writes no state.
                *self.client.lock().await = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn logout(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.sign_out().await {
                tracing::warn!("telegram: server-side sign-out failed: {e}");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        for path in [&self.session_path, &self.legacy_session_path] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!("telegram: removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(RelayError::transport_with(
                        format!("could not remove {}", path.display()),
                        e,
                    ))
                }
            }
        }
        Ok(())
    }

    async fn session_id(&self) -> Option<String> {
        self.session_path
            .exists()
            .then(|| self.session_path.display().to_string())
    }
}
