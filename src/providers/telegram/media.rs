//! Telegram media handling: inbound downloads and outbound staging.

use grammers_client::types::Media;
use grammers_client::Client;
use std::path::PathBuf;
use uuid::Uuid;

use crate::media::TempStore;
use crate::providers::{MediaAttachment, MediaContent, MediaKind};

/// Classify a media object into the normalised attachment kinds.
///
/// Photos are images; documents split on their attributes: a voice note is
/// `voice`, otherwise audio MIME is `audio`, video MIME is `video`, and
/// anything else (named file or not) is `document`.
pub fn classify(media: &Media) -> MediaKind {
    match media {
        Media::Photo(_) => MediaKind::Image,
        Media::Document(doc) => {
            let mime = doc.mime_type().unwrap_or("");
            if mime.starts_with("audio/") {
                // Voice notes arrive as unnamed OGG/Opus documents.
                if doc.name().is_empty() {
                    MediaKind::Voice
                } else {
                    MediaKind::Audio
                }
            } else if mime.starts_with("video/") {
                MediaKind::Video
            } else if mime.starts_with("image/") {
                MediaKind::Image
            } else {
                MediaKind::Document
            }
        }
        _ => MediaKind::Document,
    }
}

fn extension_for(media: &Media) -> &'static str {
    match media {
        Media::Photo(_) => "jpg",
        Media::Document(doc) => match doc.mime_type() {
            Some("audio/ogg") => "ogg",
            Some("video/mp4") => "mp4",
            Some("image/png") => "png",
            Some("image/jpeg") => "jpg",
            Some("application/pdf") => "pdf",
            _ => "bin",
        },
        _ => "bin",
    }
}

/// Download an inbound media object into the temp directory. Returns the
/// attachment and the path to delete once the handler has run. `None` means
/// the download failed and the message should proceed without attachments.
pub async fn download_inbound(
    client: &Client,
    media: &Media,
    temp: &TempStore,
) -> Option<(MediaAttachment, PathBuf)> {
    let kind = classify(media);
    if let Err(e) = tokio::fs::create_dir_all(temp.dir()).await {
        tracing::warn!("telegram: cannot create temp dir: {e}");
        return None;
    }
    let path = temp.dir().join(format!(
        "telegram-dl-{}.{}",
        Uuid::new_v4(),
        extension_for(media)
    ));

    if let Err(e) = client.download_media(media, &path).await {
        tracing::warn!("telegram: media download failed, continuing without: {e}");
        let _ = tokio::fs::remove_file(&path).await;
        return None;
    }

    let size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
    let mut attachment = MediaAttachment::new(kind, MediaContent::Path(path.clone()));
    attachment.size = size;
    if let Media::Document(doc) = media {
        attachment.mime = doc.mime_type().map(|m| m.to_string());
        let name = doc.name();
        if !name.is_empty() {
            attachment.file_name = Some(name.to_string());
        }
    }
    tracing::debug!(
        "telegram: downloaded {:?} media ({} bytes) to {}",
        kind,
        size.unwrap_or(0),
        path.display()
    );
    Some((attachment, path))
}

#[cfg(test)]
mod tests {
    // `Media` values cannot be constructed outside a live session, so the
    // classification matrix is covered by the MIME/name rules exercised in
    // the provider's integration paths. The pure helpers below keep their
    // own checks.

    #[test]
    fn test_download_name_prefix_matches_sweep_prefix() {
        assert!("telegram-dl-x.tmp".starts_with(crate::media::DOWNLOAD_PREFIX));
    }
}
