//! Voice transcription for inbound audio.
//!
//! Single-attachment voice notes are transcribed through Groq's Whisper
//! endpoint and appended to the message body as a `Transcript:` block.
//! Failures degrade to the untranscribed message.

use anyhow::{Context, Result};
use serde::Deserialize;

const GROQ_TRANSCRIPTION_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const WHISPER_MODEL: &str = "whisper-large-v3-turbo";

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribe audio bytes (OGG/Opus voice-note format works as-is).
pub async fn transcribe_audio(audio_bytes: Vec<u8>, api_key: &str) -> Result<String> {
    transcribe_with_url(audio_bytes, api_key, GROQ_TRANSCRIPTION_URL).await
}

async fn transcribe_with_url(audio_bytes: Vec<u8>, api_key: &str, url: &str) -> Result<String> {
    let client = reqwest::Client::new();

    let file_part = reqwest::multipart::Part::bytes(audio_bytes)
        .file_name("voice.ogg")
        .mime_str("audio/ogg")?;
    let form = reqwest::multipart::Form::new()
        .part("file", file_part)
        .text("model", WHISPER_MODEL)
        .text("response_format", "json");

    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {api_key}"))
        .multipart(form)
        .send()
        .await
        .context("failed to send audio for transcription")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("transcription error ({status}): {error_text}");
    }

    let result: TranscriptionResponse = response
        .json()
        .await
        .context("failed to parse transcription response")?;

    tracing::info!("transcribed {} chars of voice audio", result.text.len());
    Ok(result.text)
}

/// Append a transcript block to a message body.
pub fn append_transcript(body: &str, transcript: &str) -> String {
    if body.is_empty() {
        format!("Transcript: {transcript}")
    } else {
        format!("{body}\n\nTranscript: {transcript}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_transcript_to_empty_body() {
        assert_eq!(append_transcript("", "hello"), "Transcript: hello");
    }

    #[test]
    fn test_append_transcript_to_caption() {
        assert_eq!(
            append_transcript("voice note", "hello there"),
            "voice note\n\nTranscript: hello there"
        );
    }
}
