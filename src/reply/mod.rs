//! Auto-Reply Engine
//!
//! The pipeline behind every inbound message: whitelist, group policy,
//! optional voice transcription, session resolution, agent invocation, and
//! reply delivery through the provider the message arrived on. Heartbeat
//! fires run through the same path with `HEARTBEAT_OK` suppression.

pub mod agent;
pub mod identity;
pub mod template;
pub mod voice;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{Config, ReplyMode};
use crate::providers::{
    InboundMessage, MediaAttachment, MediaContent, MediaKind, MessageHandler, Provider,
    ProviderKind, SendOptions,
};
use crate::session::{Session, SessionManager};

use agent::{AgentProcess, ReplyFragment};
use identity::HEARTBEAT_OK;
use template::TemplateContext;

/// Prompt sent when a session's heartbeat fires.
pub const HEARTBEAT_PROMPT: &str =
    "Automated check-in: is there anything the owner should know right now? \
     Reply HEARTBEAT_OK if not.";

/// Where a heartbeat reply must be routed: the provider the session's last
/// inbound arrived on, and the address to answer.
#[derive(Debug, Clone)]
struct ReplyRoute {
    kind: ProviderKind,
    to: String,
}

pub struct AutoReplyEngine {
    config: Config,
    sessions: Arc<SessionManager>,
    providers: Mutex<HashMap<ProviderKind, Arc<dyn Provider>>>,
    active: Mutex<Vec<ProviderKind>>,
    /// Providers we have already warned about running without an allow-list.
    allow_warned: Mutex<HashSet<ProviderKind>>,
    /// session key -> reply route for heartbeat delivery.
    routes: Mutex<HashMap<String, ReplyRoute>>,
}

impl AutoReplyEngine {
    pub fn new(config: Config, sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            providers: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
            allow_warned: Mutex::new(HashSet::new()),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Register a provider for reply routing. Called by the supervisor for
    /// every provider it runs. An absent allow-list is called out here, at
    /// startup, so the operator sees it before any traffic arrives.
    pub async fn register_provider(&self, provider: Arc<dyn Provider>) {
        let kind = provider.kind();
        if self.config.allow_list_for(kind).is_none()
            && self.allow_warned.lock().await.insert(kind)
        {
            tracing::warn!("{kind}: no allowFrom configured — replying to every sender");
        }
        self.providers.lock().await.insert(kind, provider);
        let mut active = self.active.lock().await;
        if !active.contains(&kind) {
            active.push(kind);
        }
    }

    /// The handler installed via `Provider::on_message`.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let engine = self.clone();
        Arc::new(move |msg| {
            let engine = engine.clone();
            Box::pin(async move {
                engine.handle(msg).await;
            })
        })
    }

    /// Full inbound pipeline. Never propagates errors — every failure is
    /// logged and isolated to this message.
    pub async fn handle(&self, msg: InboundMessage) {
        let kind = msg.provider;

        // 1. Whitelist. An absent list allows everyone; the operator was
        // warned about that at registration time.
        if let Some(list) = self.config.allow_list_for(kind) {
            if !list.iter().any(|a| a == &msg.from) {
                tracing::info!("{kind}: sender {} not in allow-list, ignoring", msg.from);
                return;
            }
        }

        // 2. Group policy: require an operator mention or an allow-listed
        // group.
        if let Some(ref group) = msg.group {
            let allowed_groups = self.config.allowed_groups_for(kind);
            if !group.mentioned_me && !allowed_groups.contains(&group.chat_id) {
                tracing::debug!(
                    "{kind}: group {} message without mention, ignoring",
                    group.chat_id
                );
                return;
            }
        }

        // 3. Voice transcription.
        let mut body = msg.body.clone();
        if self.config.inbound.reply.transcribe_voice {
            let voices: Vec<&MediaAttachment> =
                msg.media.iter().filter(|m| m.is_voice_or_audio()).collect();
            if voices.len() == 1 {
                if let Some(text) = self.transcribe(voices[0]).await {
                    body = voice::append_transcript(&body, &text);
                }
            }
        }

        // 4. Session resolve.
        let peer = self.session_peer(&msg);
        let (session, is_new) = self.sessions.resolve(Some(&peer)).await;

        // Remember where replies for this session go.
        let reply_to = match &msg.group {
            Some(g) => g.chat_id.clone(),
            None => msg.from.clone(),
        };
        self.routes.lock().await.insert(
            session.key().to_string(),
            ReplyRoute {
                kind,
                to: reply_to.clone(),
            },
        );

        // 5-8. Serialise on the session and run the reply.
        let outcome = self
            .run_reply(&session, is_new, kind, &reply_to, &msg, &body, false)
            .await;
        if let Err(e) = outcome {
            tracing::error!("{kind}: reply pipeline failed for {}: {e}", msg.from);
            self.apologise(kind, &reply_to).await;
            self.sessions.destroy(session.key()).await;
            return;
        }

        self.sessions.touch(&session).await;
        if self.sessions.destroys_after_reply() {
            self.sessions.destroy(session.key()).await;
        }
    }

    /// Heartbeat fire for one session, routed like a normal inbound from the
    /// peer. A reply of exactly `HEARTBEAT_OK` produces no outbound message.
    pub async fn fire_heartbeat(&self, session_key: &str) {
        let Some(route) = self.routes.lock().await.get(session_key).cloned() else {
            tracing::debug!("heartbeat for {session_key} has no reply route, skipping");
            return;
        };
        let Some(session) = self.sessions.get(session_key).await else {
            return;
        };
        tracing::debug!("heartbeat firing for {session_key}");

        let prompt = template::expand(HEARTBEAT_PROMPT, &self.base_context().await);
        let synthetic = InboundMessage {
            id: format!("heartbeat-{}", uuid::Uuid::new_v4()),
            from: route.to.clone(),
            to: String::new(),
            body: prompt.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sender_name: None,
            media: vec![],
            provider: route.kind,
            group: None,
            raw: None,
        };
        if let Err(e) = self
            .run_reply(&session, false, route.kind, &route.to, &synthetic, &prompt, true)
            .await
        {
            tracing::warn!("heartbeat for {session_key} failed: {e}");
            self.sessions.destroy(session_key).await;
            return;
        }
        self.sessions.touch(&session).await;
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn session_peer(&self, msg: &InboundMessage) -> String {
        match msg.provider {
            // Telegram identifiers are namespaced so a Telegram @alice can
            // never collide with a WhatsApp sender.
            ProviderKind::Telegram => format!("telegram:{}", msg.session_peer()),
            _ => msg.session_peer().to_string(),
        }
    }

    async fn transcribe(&self, attachment: &MediaAttachment) -> Option<String> {
        let Ok(api_key) = std::env::var("GROQ_API_KEY") else {
            tracing::warn!("transcribeVoice is on but GROQ_API_KEY is not set");
            return None;
        };
        let bytes = match &attachment.content {
            MediaContent::Bytes(b) => b.clone(),
            MediaContent::Path(p) => match tokio::fs::read(p).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("could not read voice file {}: {e}", p.display());
                    return None;
                }
            },
            MediaContent::Url(_) => return None,
        };
        match voice::transcribe_audio(bytes, &api_key).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("voice transcription failed, continuing without: {e}");
                None
            }
        }
    }

    async fn base_context(&self) -> TemplateContext {
        let active = self.active.lock().await.clone();
        let mut ctx = TemplateContext::new();
        ctx.insert(
            "PROVIDERS".to_string(),
            identity::detailed_provider_list(&active),
        );
        ctx
    }

    async fn message_context(
        &self,
        msg: &InboundMessage,
        body: &str,
        session: &Session,
        is_new: bool,
    ) -> TemplateContext {
        let mut ctx = self.base_context().await;
        ctx.insert("Body".to_string(), body.to_string());
        ctx.insert(
            "BodyStripped".to_string(),
            body.split_whitespace().collect::<Vec<_>>().join(" "),
        );
        ctx.insert("From".to_string(), msg.from.clone());
        ctx.insert("To".to_string(), msg.to.clone());
        ctx.insert("MessageSid".to_string(), msg.id.clone());
        ctx.insert("SessionId".to_string(), session.key().to_string());
        ctx.insert("IsNewSession".to_string(), is_new.to_string());
        if let Some(ref name) = msg.sender_name {
            ctx.insert("SenderName".to_string(), name.clone());
        }
        if msg.from.starts_with('+') {
            ctx.insert("SenderE164".to_string(), msg.from.clone());
        }
        ctx.insert(
            "ChatType".to_string(),
            if msg.group.is_some() { "group" } else { "direct" }.to_string(),
        );
        if let Some(ref group) = msg.group {
            if let Some(ref subject) = group.subject {
                ctx.insert("GroupSubject".to_string(), subject.clone());
            }
        }
        if let Some(first) = msg.media.first() {
            ctx.insert(
                "MediaType".to_string(),
                first.mime.clone().unwrap_or_default(),
            );
            match &first.content {
                MediaContent::Url(url) => {
                    ctx.insert("MediaUrl".to_string(), url.clone());
                }
                MediaContent::Path(path) => {
                    ctx.insert("MediaPath".to_string(), path.display().to_string());
                }
                MediaContent::Bytes(_) => {}
            }
        }
        ctx
    }

    /// Steps 5-7: invoke the agent (or expand the text template) under the
    /// session lock and deliver the assembled reply.
    #[allow(clippy::too_many_arguments)]
    async fn run_reply(
        &self,
        session: &Arc<Session>,
        is_new: bool,
        kind: ProviderKind,
        reply_to: &str,
        msg: &InboundMessage,
        body: &str,
        is_heartbeat: bool,
    ) -> crate::error::Result<()> {
        let _guard = session.acquire().await;

        let reply = &self.config.inbound.reply;
        match reply.mode {
            ReplyMode::Text => {
                let ctx = self.message_context(msg, body, session.as_ref(), is_new).await;
                let text = template::expand(reply.text.as_deref().unwrap_or(""), &ctx);
                if !text.trim().is_empty() {
                    self.deliver(kind, reply_to, &text, &[]).await;
                }
                Ok(())
            }
            ReplyMode::Command => {
                self.run_agent_reply(session, is_new, kind, reply_to, msg, body, is_heartbeat)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent_reply(
        &self,
        session: &Arc<Session>,
        is_new: bool,
        kind: ProviderKind,
        reply_to: &str,
        msg: &InboundMessage,
        body: &str,
        is_heartbeat: bool,
    ) -> crate::error::Result<()> {
        let reply_cfg = &self.config.inbound.reply;

        // Reuse the live agent or spawn a fresh one with the identity prompt.
        let agent = match session.agent().await.filter(|a| a.is_running()) {
            Some(agent) => agent,
            None => {
                let provider = self.providers.lock().await.get(&kind).cloned();
                let intro = match &reply_cfg.session_intro {
                    Some(custom) => {
                        let ctx = self
                            .message_context(msg, body, session.as_ref(), is_new)
                            .await;
                        template::expand(custom, &ctx)
                    }
                    None => {
                        let caps = provider
                            .as_ref()
                            .map(|p| p.capabilities().clone())
                            .unwrap_or_else(|| {
                                crate::providers::ProviderCapabilities::for_kind(kind)
                            });
                        identity::build_identity(
                            kind,
                            &caps,
                            crate::config::paths::telegram_temp_dir().as_path(),
                            &self.active.lock().await.clone(),
                        )
                    }
                };
                let agent = Arc::new(AgentProcess::spawn(&reply_cfg.command, &intro).await?);
                session.set_agent(agent.clone()).await;
                agent
            }
        };

        agent.send_prompt(body).await?;

        // Stream fragments, delivering partial paragraphs when configured.
        let provider = self.providers.lock().await.get(&kind).cloned();
        let mut full_body = String::new();
        let mut pending = String::new();
        let mut media_paths = Vec::new();
        let mut typed = false;
        let mut streamed_any = false;

        loop {
            let fragment = agent.next_fragment().await;
            match fragment {
                Some(ReplyFragment::Text(line)) => {
                    if !full_body.is_empty() {
                        full_body.push('\n');
                    }
                    full_body.push_str(&line);

                    if line.trim().is_empty() {
                        if reply_cfg.stream_replies && !pending.trim().is_empty() {
                            self.deliver_chunk(&provider, kind, reply_to, &pending, &mut typed)
                                .await;
                            streamed_any = true;
                        }
                        pending.clear();
                    } else {
                        if !pending.is_empty() {
                            pending.push('\n');
                        }
                        pending.push_str(&line);
                    }
                }
                Some(ReplyFragment::Media(path)) => media_paths.push(path),
                Some(ReplyFragment::Tool(event)) => {
                    tracing::info!("agent: {event}");
                    if reply_cfg.forward_tool_events {
                        self.deliver_chunk(&provider, kind, reply_to, &event, &mut typed)
                            .await;
                    }
                }
                Some(ReplyFragment::End) => break,
                None => {
                    session.clear_agent().await;
                    if full_body.trim().is_empty() && media_paths.is_empty() {
                        return Err(crate::error::RelayError::transport(
                            "agent exited without producing a reply",
                        ));
                    }
                    break;
                }
            }
        }

        let full_body = full_body.trim().to_string();

        // Heartbeat no-op acknowledgement: nothing leaves the process.
        if full_body == HEARTBEAT_OK && media_paths.is_empty() {
            if is_heartbeat {
                tracing::debug!("heartbeat acknowledged idle for {}", session.key());
            } else {
                tracing::debug!("suppressing HEARTBEAT_OK reply for {}", session.key());
            }
            return Ok(());
        }

        let remaining = if reply_cfg.stream_replies && streamed_any {
            pending.trim().to_string()
        } else {
            full_body
        };

        let media: Vec<MediaAttachment> = media_paths
            .into_iter()
            .map(|p| MediaAttachment::new(MediaKind::Document, MediaContent::Path(p)))
            .collect();

        if !remaining.is_empty() || !media.is_empty() {
            self.deliver(kind, reply_to, &remaining, &media).await;
        }
        Ok(())
    }

    async fn deliver_chunk(
        &self,
        provider: &Option<Arc<dyn Provider>>,
        kind: ProviderKind,
        reply_to: &str,
        text: &str,
        typed: &mut bool,
    ) {
        let Some(provider) = provider else { return };
        if !*typed && provider.capabilities().typing_indicator {
            provider.send_typing(reply_to).await;
            *typed = true;
        }
        let result = provider
            .send(reply_to, text, SendOptions::default())
            .await;
        match result {
            Ok(r) if r.is_failed() => {
                tracing::warn!("{kind}: partial reply failed: {:?}", r.error)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("{kind}: partial reply failed: {e}"),
        }
    }

    /// Send the assembled reply, typing first where supported, retrying a
    /// failed send once.
    async fn deliver(&self, kind: ProviderKind, to: &str, body: &str, media: &[MediaAttachment]) {
        let Some(provider) = self.providers.lock().await.get(&kind).cloned() else {
            tracing::error!("{kind}: no provider registered for reply delivery");
            return;
        };

        if provider.capabilities().typing_indicator {
            provider.send_typing(to).await;
        }

        let options = SendOptions {
            media: media.to_vec(),
            reply_to: None,
            typing: false,
        };
        for attempt in 0..2 {
            match provider.send(to, body, options.clone()).await {
                Ok(result) if !result.is_failed() => return,
                Ok(result) => {
                    tracing::warn!(
                        "{kind}: send to {to} failed (attempt {}): {:?}",
                        attempt + 1,
                        result.error
                    );
                }
                Err(e) => {
                    tracing::warn!("{kind}: send to {to} failed (attempt {}): {e}", attempt + 1);
                }
            }
        }
    }

    async fn apologise(&self, kind: ProviderKind, to: &str) {
        self.deliver(
            kind,
            to,
            "Sorry — something went wrong on my side and this conversation was reset. \
             Please send your message again.",
            &[],
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionScope;
    use crate::providers::GroupContext;

    fn test_config(allow: Option<Vec<String>>) -> Config {
        let mut config = Config::default();
        config.inbound.allow_from = allow;
        config.inbound.reply.command = vec!["true".into()];
        config
    }

    fn inbound(provider: ProviderKind, from: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            from: from.into(),
            to: "+15550000000".into(),
            body: "ping".into(),
            timestamp_ms: 0,
            sender_name: None,
            media: vec![],
            provider,
            group: None,
            raw: None,
        }
    }

    fn engine(config: Config) -> Arc<AutoReplyEngine> {
        let sessions = Arc::new(SessionManager::new(SessionScope::PerSender, 1440, None));
        AutoReplyEngine::new(config, sessions)
    }

    #[tokio::test]
    async fn test_whitelist_reject_creates_no_session() {
        let engine = engine(test_config(Some(vec!["+15551234567".into()])));
        engine
            .handle(inbound(ProviderKind::WaWeb, "+1234567890"))
            .await;
        assert_eq!(engine.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_empty_whitelist_denies_all() {
        let engine = engine(test_config(Some(vec![])));
        engine
            .handle(inbound(ProviderKind::WaWeb, "+15551234567"))
            .await;
        assert_eq!(engine.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_group_without_mention_discarded() {
        let engine = engine(test_config(None));
        let mut msg = inbound(ProviderKind::WaWeb, "+15551234567");
        msg.group = Some(GroupContext {
            chat_id: "12345-678@g.us".into(),
            subject: None,
            mentioned_me: false,
        });
        engine.handle(msg).await;
        assert_eq!(engine.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_telegram_sender_namespaced() {
        let engine = engine(test_config(None));
        let msg = inbound(ProviderKind::Telegram, "@alice");
        assert_eq!(engine.session_peer(&msg), "telegram:@alice");

        let wa = inbound(ProviderKind::WaWeb, "+15551234567");
        assert_eq!(engine.session_peer(&wa), "+15551234567");
    }

    #[tokio::test]
    async fn test_group_peer_uses_chat_id() {
        let engine = engine(test_config(None));
        let mut msg = inbound(ProviderKind::WaWeb, "+15551234567");
        msg.group = Some(GroupContext {
            chat_id: "12345-678@g.us".into(),
            subject: None,
            mentioned_me: true,
        });
        assert_eq!(engine.session_peer(&msg), "12345-678@g.us");
    }

    #[tokio::test]
    async fn test_heartbeat_without_route_is_noop() {
        let engine = engine(test_config(None));
        // No session has been created, so there is no route to reply on.
        engine.fire_heartbeat("+15551234567").await;
        assert_eq!(engine.sessions.len().await, 0);
    }
}
