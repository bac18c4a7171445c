//! WhatsApp-Web inbound translation.
//!
//! Turns the backend's message objects into the normalised inbound shape:
//! unwraps nested wrappers, extracts text and media, resolves the sender to
//! E.164 (consulting the lid reverse mapping for linked-id addresses), and
//! attaches group context with mention detection.

use std::path::Path;
use std::sync::Arc;

use wacore::types::message::MessageInfo;
use waproto::whatsapp::Message;
use whatsapp_rust::client::Client;

use super::store::WaStore;
use crate::providers::{
    GroupContext, InboundMessage, MediaAttachment, MediaContent, MediaKind, ProviderKind,
};
use crate::utils::{is_group_jid, is_lid_jid, jid_to_e164};

/// Header prepended to relay-sent messages, used to tell our own echoes
/// apart from the operator typing on their phone.
pub const REPLY_HEADER: &str = "\u{200b}";

/// Unwrap nested message wrappers (device_sent, ephemeral, view_once,
/// document_with_caption). Returns the innermost message with content.
pub fn unwrap_message(msg: &Message) -> &Message {
    if let Some(ref dsm) = msg.device_sent_message {
        if let Some(ref inner) = dsm.message {
            return unwrap_message(inner);
        }
    }
    if let Some(ref eph) = msg.ephemeral_message {
        if let Some(ref inner) = eph.message {
            return unwrap_message(inner);
        }
    }
    if let Some(ref vo) = msg.view_once_message {
        if let Some(ref inner) = vo.message {
            return unwrap_message(inner);
        }
    }
    if let Some(ref dwc) = msg.document_with_caption_message {
        if let Some(ref inner) = dwc.message {
            return unwrap_message(inner);
        }
    }
    msg
}

/// Extract plain text: conversation, extended text, or a media caption.
pub fn extract_text(msg: &Message) -> Option<String> {
    let msg = unwrap_message(msg);
    if let Some(ref conv) = msg.conversation {
        if !conv.is_empty() {
            return Some(conv.clone());
        }
    }
    if let Some(ref ext) = msg.extended_text_message {
        if let Some(ref text) = ext.text {
            return Some(text.clone());
        }
    }
    if let Some(ref img) = msg.image_message {
        if let Some(ref caption) = img.caption {
            if !caption.is_empty() {
                return Some(caption.clone());
            }
        }
    }
    if let Some(ref vid) = msg.video_message {
        if let Some(ref caption) = vid.caption {
            if !caption.is_empty() {
                return Some(caption.clone());
            }
        }
    }
    None
}

/// JIDs mentioned in the message, for the group mention policy.
pub fn mentioned_jids(msg: &Message) -> Vec<String> {
    let msg = unwrap_message(msg);
    msg.extended_text_message
        .as_ref()
        .and_then(|ext| ext.context_info.as_ref())
        .map(|ctx| ctx.mentioned_jid.clone())
        .unwrap_or_default()
}

/// Download the first media attachment, if any, into an in-memory buffer.
/// Failures degrade to a message without attachments.
pub async fn extract_media(msg: &Message, client: &Client) -> Vec<MediaAttachment> {
    let msg = unwrap_message(msg);

    let (kind, downloadable, mime, file_name): (
        MediaKind,
        Option<std::result::Result<Vec<u8>, String>>,
        Option<String>,
        Option<String>,
    ) = if let Some(ref img) = msg.image_message {
        (
            MediaKind::Image,
            Some(client.download(img.as_ref()).await.map_err(|e| e.to_string())),
            img.mimetype.clone(),
            None,
        )
    } else if let Some(ref vid) = msg.video_message {
        (
            MediaKind::Video,
            Some(client.download(vid.as_ref()).await.map_err(|e| e.to_string())),
            vid.mimetype.clone(),
            None,
        )
    } else if let Some(ref aud) = msg.audio_message {
        let kind = if aud.ptt.unwrap_or(false) {
            MediaKind::Voice
        } else {
            MediaKind::Audio
        };
        (
            kind,
            Some(client.download(aud.as_ref()).await.map_err(|e| e.to_string())),
            aud.mimetype.clone(),
            None,
        )
    } else if let Some(ref doc) = msg.document_message {
        (
            MediaKind::Document,
            Some(client.download(doc.as_ref()).await.map_err(|e| e.to_string())),
            doc.mimetype.clone(),
            doc.file_name.clone(),
        )
    } else {
        return Vec::new();
    };

    match downloadable {
        Some(Ok(bytes)) => {
            let size = bytes.len() as u64;
            let mut attachment = MediaAttachment::new(kind, MediaContent::Bytes(bytes));
            attachment.mime = mime;
            attachment.file_name = file_name;
            attachment.size = Some(size);
            vec![attachment]
        }
        Some(Err(e)) => {
            tracing::warn!("wa-web: media download failed, dropping attachment: {e}");
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// Resolve a sender JID to E.164. Linked-id addresses go through the store's
/// lid↔phone mapping, then through any `lid-mapping-<id>_reverse.json` files
/// in the credentials directory. `None` means the sender is not addressable
/// and the message must be dropped.
pub async fn resolve_sender(
    sender_jid: &str,
    store: &Arc<WaStore>,
    credentials_dir: &Path,
) -> Option<String> {
    if let Some(e164) = jid_to_e164(sender_jid) {
        return Some(e164);
    }
    if !is_lid_jid(sender_jid) {
        return None;
    }

    let lid_user = sender_jid
        .split('@')
        .next()
        .map(|u| u.split(':').next().unwrap_or(u).to_string())?;

    if let Ok(Some(entry)) = store.get_lid_mapping(&lid_user).await {
        let phone = entry.phone_number;
        let canonical = if phone.starts_with('+') {
            phone
        } else {
            format!("+{phone}")
        };
        return Some(canonical);
    }

    lookup_reverse_mapping_files(&lid_user, credentials_dir)
}

/// Scan `lid-mapping-<id>_reverse.json` files for a lid → phone entry.
fn lookup_reverse_mapping_files(lid_user: &str, credentials_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(credentials_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("lid-mapping-") || !name.ends_with("_reverse.json") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(map) = serde_json::from_str::<std::collections::HashMap<String, String>>(&contents)
        else {
            tracing::debug!("wa-web: unparseable reverse mapping file {name}");
            continue;
        };
        if let Some(phone) = map.get(lid_user) {
            let digits = phone.trim_start_matches('+');
            return Some(format!("+{digits}"));
        }
    }
    None
}

/// Translate one backend event into the normalised inbound shape.
///
/// Returns `None` for messages the relay must not process: our own reply
/// echoes, empty payloads, and senders that cannot be mapped to E.164.
pub async fn build_inbound(
    msg: &Message,
    info: &MessageInfo,
    client: &Client,
    store: &Arc<WaStore>,
    credentials_dir: &Path,
    own_jids: &[String],
) -> Option<InboundMessage> {
    let text = extract_text(msg);

    // The operator's own account relays for itself: messages typed on the
    // phone are also "from me". Only our tagged replies are echoes.
    if info.source.is_from_me {
        match text.as_deref() {
            Some(t) if t.starts_with(REPLY_HEADER) => return None,
            Some(_) => {}
            None => return None,
        }
    }

    let sender_jid = info.source.sender.to_string();
    let Some(from) = resolve_sender(&sender_jid, store, credentials_dir).await else {
        tracing::debug!(
            "wa-web: dropping message {} from unmappable sender {sender_jid}",
            info.id
        );
        return None;
    };

    let media = extract_media(msg, client).await;
    let body = text.unwrap_or_default();
    if body.is_empty() && media.is_empty() {
        return None;
    }

    let chat_jid = info.source.chat.to_string();
    let group = if is_group_jid(&chat_jid) {
        let mentioned = mentioned_jids(msg);
        let mentioned_me = own_jids
            .iter()
            .any(|own| mentioned.iter().any(|m| m == own));
        Some(GroupContext {
            chat_id: chat_jid.clone(),
            subject: None,
            mentioned_me,
        })
    } else {
        None
    };

    let sender_name = if info.push_name.is_empty() {
        group.as_ref().map(|_| from.clone())
    } else {
        Some(info.push_name.clone())
    };

    Some(InboundMessage {
        id: info.id.clone(),
        from,
        to: jid_to_e164(&chat_jid).unwrap_or_default(),
        body,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        sender_name,
        media,
        provider: ProviderKind::WaWeb,
        group,
        raw: None,
    })
}

/// Render pairing QR data for the terminal using half-block characters,
/// two module rows per text line.
pub fn render_qr_terminal(data: &str) -> Option<String> {
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L).ok()?;
    let width = code.width();
    let colors: Vec<Color> = code.into_colors();
    let is_dark = |row: usize, col: usize| -> bool {
        row < width && col < width && colors[row * width + col] == Color::Dark
    };

    let mut out = String::new();
    let mut row = 0;
    while row < width {
        for col in 0..width {
            let top = is_dark(row, col);
            let bottom = row + 1 < width && is_dark(row + 1, col);
            out.push(match (top, bottom) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
        row += 2;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_conversation() {
        let msg = Message {
            conversation: Some("hello".to_string()),
            ..Default::default()
        };
        assert_eq!(extract_text(&msg), Some("hello".to_string()));
    }

    #[test]
    fn test_extract_text_image_caption() {
        let msg = Message {
            image_message: Some(Box::new(waproto::whatsapp::message::ImageMessage {
                caption: Some("look".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(extract_text(&msg), Some("look".to_string()));
    }

    #[test]
    fn test_unwrap_ephemeral() {
        let inner = Message {
            conversation: Some("wrapped".to_string()),
            ..Default::default()
        };
        let msg = Message {
            ephemeral_message: Some(Box::new(waproto::whatsapp::message::FutureProofMessage {
                message: Some(Box::new(inner)),
            })),
            ..Default::default()
        };
        assert_eq!(extract_text(&msg), Some("wrapped".to_string()));
    }

    #[test]
    fn test_mentioned_jids_empty_without_context() {
        let msg = Message {
            conversation: Some("hi".to_string()),
            ..Default::default()
        };
        assert!(mentioned_jids(&msg).is_empty());
    }

    #[test]
    fn test_reverse_mapping_file_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("lid-mapping-42_reverse.json"),
            r#"{"99887766": "491234"}"#,
        )
        .unwrap();
        // Unrelated files are skipped.
        std::fs::write(tmp.path().join("other.json"), "{}").unwrap();

        assert_eq!(
            lookup_reverse_mapping_files("99887766", tmp.path()),
            Some("+491234".to_string())
        );
        assert_eq!(lookup_reverse_mapping_files("000", tmp.path()), None);
    }

    #[test]
    fn test_render_qr_terminal_produces_blocks() {
        let qr = render_qr_terminal("pairing-payload").unwrap();
        assert!(!qr.is_empty());
        assert!(qr.lines().count() > 10);
    }
}
