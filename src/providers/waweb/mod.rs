//! WhatsApp-Web Provider
//!
//! Speaks the WhatsApp Web protocol (Noise handshake + Signal encryption)
//! via `whatsapp-rust`. Pairing is a QR scan; credentials persist in the
//! store under `<config>/credentials/` so later runs reconnect silently.
//! The socket lifecycle runs Disconnected → Connecting → (Pairing |
//! Authenticated) → Live, with exponential-backoff reconnects; a
//! backend-signalled logout is non-recoverable.

pub(crate) mod handler;
pub mod reconnect;
pub(crate) mod store;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use crate::config::{paths, Config};
use crate::error::{RelayError, Result};
use crate::providers::{
    DeliveryStatus, ListenTuning, MediaAttachment, MediaContent, MediaKind, MessageHandler,
    Provider, ProviderCapabilities, ProviderKind, SendOptions, SendResult,
};
use crate::utils::{e164_to_jid, normalize_identifier, split_message, truncate_str};

use handler::REPLY_HEADER;
use store::WaStore;

const SESSION_DB: &str = "wa-web.db";
const MAX_CHUNK: usize = 4000;

/// Shared state between the provider facade, the event closure, and the
/// reconnect loop.
struct Inner {
    caps: ProviderCapabilities,
    credentials_dir: PathBuf,
    /// The operator's own JIDs, for group mention detection. Derived from
    /// the allow-list's first entry (the operator's number).
    own_jids: Vec<String>,
    store: Mutex<Option<Arc<WaStore>>>,
    client: Mutex<Option<Arc<Client>>>,
    handler: std::sync::Mutex<Option<MessageHandler>>,
    connected: AtomicBool,
    logged_out: AtomicBool,
    /// Set by `Event::Connected`; the reconnect loop resets its attempt
    /// counter when a pass actually reached the Live state.
    connected_this_pass: AtomicBool,
    disconnected: Notify,
    /// Handler invocations currently running. `stop_listening` waits for
    /// this to drain so cleanup closures inside handlers complete.
    in_flight: std::sync::atomic::AtomicUsize,
    drained: Notify,
}

pub struct WaWebProvider {
    inner: Arc<Inner>,
    listen_cancel: Mutex<Option<CancellationToken>>,
    listen_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Inner {
    async fn open_store(&self) -> Result<Arc<WaStore>> {
        if let Some(store) = self.store.lock().await.clone() {
            return Ok(store);
        }
        std::fs::create_dir_all(&self.credentials_dir)
            .map_err(|e| RelayError::transport_with("cannot create credentials dir", e))?;
        let db_path = self.credentials_dir.join(SESSION_DB);
        let store = Arc::new(
            WaStore::open(db_path.to_string_lossy().as_ref())
                .await
                .map_err(|e| RelayError::transport(format!("credential store: {e}")))?,
        );
        *self.store.lock().await = Some(store.clone());
        Ok(store)
    }

    async fn connected_client(&self) -> Result<Arc<Client>> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| RelayError::transport("wa-web client is not connected"))
    }

    /// Build a bot wired to this provider's shared state and start it.
    /// Returns an abort handle for the running connection.
    async fn build_and_run(
        self: &Arc<Self>,
        store: Arc<WaStore>,
        show_qr: bool,
        pair_done: Option<mpsc::Sender<()>>,
    ) -> Result<tokio::task::AbortHandle> {
        let inner = self.clone();

        let mut bot = Bot::builder()
            .with_backend(store)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let inner = inner.clone();
                let pair_done = pair_done.clone();
                async move {
                    inner.on_event(event, client, show_qr, pair_done).await;
                }
            })
            .build()
            .await
            .map_err(|e| RelayError::transport(format!("bot build failed: {e}")))?;

        *self.client.lock().await = Some(bot.client());

        let run_handle = bot
            .run()
            .await
            .map_err(|e| RelayError::transport(format!("bot run failed: {e}")))?;

        let abort = run_handle.abort_handle();
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = run_handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("wa-web: connection task ended: {e}");
                }
            }
            inner.connected.store(false, Ordering::SeqCst);
            inner.disconnected.notify_waiters();
        });
        Ok(abort)
    }

    async fn on_event(
        self: Arc<Self>,
        event: Event,
        client: Arc<Client>,
        show_qr: bool,
        pair_done: Option<mpsc::Sender<()>>,
    ) {
        match event {
            Event::PairingQrCode { ref code, .. } => {
                tracing::info!("wa-web: scan this QR code with your phone");
                if show_qr {
                    match handler::render_qr_terminal(code) {
                        Some(qr) => println!("{qr}"),
                        None => println!("QR payload: {code}"),
                    }
                }
            }
            Event::PairSuccess(_) => {
                tracing::info!("wa-web: pairing successful");
                if let Some(ref tx) = pair_done {
                    let _ = tx.send(()).await;
                }
            }
            Event::Connected(_) => {
                tracing::info!("wa-web: connected");
                self.connected.store(true, Ordering::SeqCst);
                self.connected_this_pass.store(true, Ordering::SeqCst);
                *self.client.lock().await = Some(client);
                if let Some(ref tx) = pair_done {
                    let _ = tx.send(()).await;
                }
            }
            Event::Disconnected(_) => {
                tracing::warn!("wa-web: disconnected");
                self.connected.store(false, Ordering::SeqCst);
                *self.client.lock().await = None;
                self.disconnected.notify_waiters();
            }
            Event::LoggedOut(_) => {
                tracing::warn!("wa-web: logged out by the backend");
                self.connected.store(false, Ordering::SeqCst);
                self.logged_out.store(true, Ordering::SeqCst);
                *self.client.lock().await = None;
                self.disconnected.notify_waiters();
            }
            Event::Message(msg, info) => {
                let handler = self.handler.lock().expect("handler lock").clone();
                let Some(handler) = handler else { return };
                let Some(store) = self.store.lock().await.clone() else {
                    return;
                };
                let inbound = handler::build_inbound(
                    &msg,
                    &info,
                    client.as_ref(),
                    &store,
                    &self.credentials_dir,
                    &self.own_jids,
                )
                .await;
                if let Some(inbound) = inbound {
                    tracing::debug!(
                        "wa-web: inbound {} from {}: {}",
                        inbound.id,
                        inbound.from,
                        truncate_str(&inbound.body, 50),
                    );
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    handler(inbound).await;
                    if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.drained.notify_waiters();
                    }
                }
            }
            other => {
                tracing::trace!("wa-web: unhandled event: {other:?}");
            }
        }
    }

    /// Resolve a send target into a JID: raw JIDs pass through, anything
    /// else must normalise to E.164.
    fn resolve_target(&self, to: &str) -> Result<Jid> {
        let jid_str = if to.contains('@') {
            to.to_string()
        } else {
            e164_to_jid(&normalize_identifier(ProviderKind::WaWeb, to)?)
        };
        jid_str
            .parse::<Jid>()
            .map_err(|e| RelayError::NotFound(format!("invalid JID {jid_str:?}: {e}")))
    }

    /// Fetch media bytes for an attachment, enforcing the size cap before
    /// any upload.
    async fn attachment_bytes(&self, attachment: &MediaAttachment) -> Result<Vec<u8>> {
        self.caps.check_media_size(attachment.size)?;
        let bytes = match &attachment.content {
            MediaContent::Bytes(b) => b.clone(),
            MediaContent::Path(p) => tokio::fs::read(p)
                .await
                .map_err(|e| RelayError::transport_with("cannot read media file", e))?,
            MediaContent::Url(url) => {
                let staged = crate::media::TempStore::for_telegram()
                    .download_url(url, self.caps.max_media_size)
                    .await?;
                let bytes = tokio::fs::read(staged.path())
                    .await
                    .map_err(|e| RelayError::transport_with("cannot read staged media", e))?;
                staged.release();
                bytes
            }
        };
        self.caps.check_media_size(Some(bytes.len() as u64))?;
        Ok(bytes)
    }

    async fn send_media_message(
        &self,
        client: &Client,
        jid: &Jid,
        attachment: &MediaAttachment,
        caption: &str,
    ) -> Result<String> {
        let bytes = self.attachment_bytes(attachment).await?;
        let media_type = match attachment.kind {
            MediaKind::Image => whatsapp_rust::download::MediaType::Image,
            MediaKind::Video => whatsapp_rust::download::MediaType::Video,
            MediaKind::Audio | MediaKind::Voice => whatsapp_rust::download::MediaType::Audio,
            MediaKind::Document => whatsapp_rust::download::MediaType::Document,
        };
        let upload = client
            .upload(bytes, media_type)
            .await
            .map_err(|e| RelayError::transport(format!("media upload failed: {e}")))?;

        let message = match attachment.kind {
            MediaKind::Image => waproto::whatsapp::Message {
                image_message: Some(Box::new(waproto::whatsapp::message::ImageMessage {
                    mimetype: attachment.mime.clone().or(Some("image/jpeg".to_string())),
                    caption: (!caption.is_empty()).then(|| caption.to_string()),
                    url: Some(upload.url),
                    direct_path: Some(upload.direct_path),
                    media_key: Some(upload.media_key),
                    file_enc_sha256: Some(upload.file_enc_sha256),
                    file_sha256: Some(upload.file_sha256),
                    file_length: Some(upload.file_length),
                    ..Default::default()
                })),
                ..Default::default()
            },
            _ => waproto::whatsapp::Message {
                document_message: Some(Box::new(waproto::whatsapp::message::DocumentMessage {
                    mimetype: attachment.mime.clone(),
                    file_name: attachment.file_name.clone(),
                    caption: (!caption.is_empty()).then(|| caption.to_string()),
                    url: Some(upload.url),
                    direct_path: Some(upload.direct_path),
                    media_key: Some(upload.media_key),
                    file_enc_sha256: Some(upload.file_enc_sha256),
                    file_sha256: Some(upload.file_sha256),
                    file_length: Some(upload.file_length),
                    ..Default::default()
                })),
                ..Default::default()
            },
        };

        client
            .send_message(jid.clone(), message)
            .await
            .map_err(|e| RelayError::transport(format!("media send failed: {e}")))
    }
}

impl WaWebProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let own_jids = config
            .allow_list_for(ProviderKind::WaWeb)
            .and_then(|list| list.first().cloned())
            .map(|owner| vec![e164_to_jid(&owner)])
            .unwrap_or_default();

        Ok(Self {
            inner: Arc::new(Inner {
                caps: ProviderCapabilities::for_kind(ProviderKind::WaWeb),
                credentials_dir: paths::credentials_dir(),
                own_jids,
                store: Mutex::new(None),
                client: Mutex::new(None),
                handler: std::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                logged_out: AtomicBool::new(false),
                connected_this_pass: AtomicBool::new(false),
                disconnected: Notify::new(),
                in_flight: std::sync::atomic::AtomicUsize::new(0),
                drained: Notify::new(),
            }),
            listen_cancel: Mutex::new(None),
            listen_task: Mutex::new(None),
        })
    }

    /// Whether paired credentials exist on disk. Cheap enough for the
    /// supervisor's auto-detection.
    pub fn credentials_present() -> bool {
        paths::credentials_dir().join(SESSION_DB).exists()
    }
}

#[async_trait]
impl Provider for WaWebProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WaWeb
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.inner.caps
    }

    async fn initialize(&self) -> Result<()> {
        self.inner.open_store().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_listening().await?;
        *self.inner.client.lock().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, to: &str, body: &str, options: SendOptions) -> Result<SendResult> {
        let jid = self.inner.resolve_target(to)?;
        if let Some(first) = options.media.first() {
            self.inner.caps.check_media_size(first.size)?;
        }
        let client = self.inner.connected_client().await?;

        if options.typing {
            self.send_typing(to).await;
        }

        let outcome: Result<String> = if let Some(attachment) = options.media.first() {
            self.inner
                .send_media_message(&client, &jid, attachment, body)
                .await
        } else {
            let tagged = format!("{REPLY_HEADER}{body}");
            let mut last_id = String::new();
            let mut failure: Option<String> = None;
            for chunk in split_message(&tagged, MAX_CHUNK) {
                let message = waproto::whatsapp::Message {
                    conversation: Some(chunk.to_string()),
                    ..Default::default()
                };
                match client.send_message(jid.clone(), message).await {
                    Ok(id) => last_id = id,
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            match failure {
                Some(e) => Err(RelayError::transport(e)),
                None => Ok(last_id),
            }
        };

        match outcome {
            Ok(message_id) => {
                Ok(SendResult::sent(message_id).with_meta("user_id", jid.to_string()))
            }
            Err(RelayError::Transport { message, .. }) => Ok(SendResult::failed(message)),
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, to: &str) {
        let Ok(jid) = self.inner.resolve_target(to) else {
            return;
        };
        let Ok(client) = self.inner.connected_client().await else {
            return;
        };
        if let Err(e) = client.chatstate().send_composing(&jid).await {
            tracing::debug!("wa-web: typing indicator failed: {e}");
        }
    }

    async fn delivery_status(&self, _message_id: &str) -> DeliveryStatus {
        // The socket protocol does not expose reliable per-message acks.
        DeliveryStatus::unknown_now()
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.inner.handler.lock().expect("handler lock") = Some(handler);
    }

    async fn start_listening(
        &self,
        cancel: CancellationToken,
        tuning: &ListenTuning,
    ) -> Result<()> {
        if self.listen_task.lock().await.is_some() {
            return Ok(());
        }
        let store = self.inner.open_store().await?;
        if !store
            .device_exists()
            .await
            .map_err(|e| RelayError::transport(format!("credential store: {e}")))?
        {
            return Err(RelayError::Auth(
                "wa-web has no paired credentials — run `warelay login --provider wa-web`".into(),
            ));
        }

        let listen_cancel = cancel.child_token();
        *self.listen_cancel.lock().await = Some(listen_cancel.clone());

        // Optional keepalive watchdog: nudges the reconnect loop if the
        // socket dropped without a Disconnected event reaching us.
        if let Some(every) = tuning.web_heartbeat {
            let inner = self.inner.clone();
            let cancel = listen_cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    if !inner.connected.load(Ordering::SeqCst) {
                        tracing::debug!("wa-web: keepalive found the socket down");
                        inner.disconnected.notify_waiters();
                    }
                }
            });
        }

        // The run loop owns reconnection: each pass builds a bot, waits for
        // a disconnect, and backs off. A backend logout stops it for good.
        let inner = self.inner.clone();
        let policy = tuning.reconnect.clone();
        let tuning = tuning.clone();
        let task = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if listen_cancel.is_cancelled() {
                    break;
                }
                inner.connected_this_pass.store(false, Ordering::SeqCst);
                match inner.build_and_run(store.clone(), false, None).await {
                    Ok(abort) => {
                        tokio::select! {
                            _ = listen_cancel.cancelled() => {
                                abort.abort();
                                break;
                            }
                            _ = inner.disconnected.notified() => {
                                abort.abort();
                            }
                        }
                        if inner.connected_this_pass.load(Ordering::SeqCst) {
                            attempt = 0;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("wa-web: connect failed: {e}");
                    }
                }

                if inner.logged_out.load(Ordering::SeqCst) {
                    tuning.report_fatal(
                        ProviderKind::WaWeb,
                        "session was logged out on the phone; re-pair with `warelay login`",
                    );
                    break;
                }

                attempt += 1;
                if policy.attempts_exhausted(attempt) {
                    tuning.report_fatal(
                        ProviderKind::WaWeb,
                        format!("gave up after {attempt} reconnect attempts"),
                    );
                    break;
                }
                let delay = policy.delay(attempt - 1);
                tracing::info!(
                    "wa-web: reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    policy.max_attempts
                );
                tokio::select! {
                    _ = listen_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            inner.connected.store(false, Ordering::SeqCst);
        });
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        // In-flight handler invocations (and their cleanup closures) get a
        // bounded window to settle before the connection is torn down.
        let drain = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
            .await
            .is_err()
        {
            tracing::warn!("wa-web: shutdown with handler invocations still running");
        }

        if let Some(cancel) = self.listen_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.listen_task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        match self.inner.open_store().await {
            Ok(store) => store.device_exists().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn login(&self) -> Result<()> {
        let store = self.inner.open_store().await?;
        if store.device_exists().await.unwrap_or(false) {
            tracing::info!("wa-web: already paired");
            return Ok(());
        }

        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let abort = self.inner.build_and_run(store, true, Some(done_tx)).await?;

        // The library rotates QR codes until one is scanned; wait for the
        // pairing handshake with a generous ceiling.
        let paired = tokio::time::timeout(std::time::Duration::from_secs(300), done_rx.recv())
            .await
            .is_ok();
        abort.abort();
        if paired {
            tracing::info!("wa-web: login complete, credentials stored");
            Ok(())
        } else {
            Err(RelayError::Auth("QR pairing timed out".into()))
        }
    }

    async fn logout(&self) -> Result<()> {
        if let Ok(client) = self.inner.connected_client().await {
            if let Err(e) = client.logout().await {
                tracing::warn!("wa-web: server-side logout failed: {e}");
            }
        }
        let store = self.inner.open_store().await?;
        store
            .wipe()
            .await
            .map_err(|e| RelayError::transport(format!("credential wipe failed: {e}")))?;
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.client.lock().await = None;
        tracing::info!("wa-web: local credentials erased");
        Ok(())
    }

    async fn session_id(&self) -> Option<String> {
        let path = self.inner.credentials_dir.join(SESSION_DB);
        path.exists().then(|| path.display().to_string())
    }
}
