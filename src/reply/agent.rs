//! Agent subprocess management and reply-stream parsing.
//!
//! Each session owns at most one agent process. The engine writes prompts to
//! the agent's stdin and consumes stdout as a stream of reply fragments:
//! text chunks, `MEDIA:` attachment markers, tool-activity markers, and an
//! end-of-reply marker (`EOM`, documented in the identity prompt). Process
//! exit also ends the reply, which keeps one-shot commands working.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::identity::{END_MARKER, MEDIA_MARKER};
use crate::error::{RelayError, Result};

/// One parsed unit of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFragment {
    Text(String),
    Media(PathBuf),
    /// Tool-activity announcement (file read, edit, shell). Logged, and
    /// forwarded to the peer only when configured.
    Tool(String),
    End,
}

/// Emoji prefixes agents use to announce tool activity.
const TOOL_PREFIXES: [&str; 5] = ["🛠", "🔧", "📖", "✏️", "🌐"];

/// Classify one stdout line into a fragment.
pub fn parse_line(line: &str) -> ReplyFragment {
    let trimmed = line.trim_end();
    if trimmed == END_MARKER {
        return ReplyFragment::End;
    }
    if let Some(rest) = trimmed.strip_prefix(MEDIA_MARKER) {
        let path = rest.trim();
        if path.starts_with('/') {
            return ReplyFragment::Media(PathBuf::from(path));
        }
    }
    if TOOL_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return ReplyFragment::Tool(trimmed.to_string());
    }
    ReplyFragment::Text(line.to_string())
}

/// A fully assembled reply.
#[derive(Debug, Default)]
pub struct ReplyAssembly {
    pub body: String,
    pub media: Vec<PathBuf>,
    pub tool_events: Vec<String>,
    /// The stream ended because the process exited rather than via the end
    /// marker. The next prompt needs a fresh spawn.
    pub process_exited: bool,
}

/// A running agent subprocess bound to one session.
pub struct AgentProcess {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    fragments: Mutex<mpsc::Receiver<ReplyFragment>>,
    exited: std::sync::atomic::AtomicBool,
}

impl AgentProcess {
    /// Spawn the configured command, write the identity prompt as the first
    /// stdin line, and start the stdout reader task.
    pub async fn spawn(command: &[String], intro: &str) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RelayError::Config("reply command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::transport_with(format!("failed to spawn {program}"), e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Internal("agent stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Internal("agent stdout not piped".into()))?;

        let (tx, rx) = mpsc::channel::<ReplyFragment>(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(parse_line(&line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("agent stdout read error: {e}");
                        break;
                    }
                }
            }
            // Receiver sees the closed channel as end-of-stream.
        });

        if !intro.is_empty() {
            let mut framed = intro.replace('\n', "\u{2028}");
            framed.push('\n');
            stdin
                .write_all(framed.as_bytes())
                .await
                .map_err(|e| RelayError::transport_with("failed to write agent intro", e))?;
        }

        tracing::info!("agent spawned: {program}");
        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            fragments: Mutex::new(rx),
            exited: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Whether the process is still usable for another prompt.
    pub fn is_running(&self) -> bool {
        !self.exited.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Write one prompt as a single stdin line. Embedded newlines are folded
    /// so the agent sees exactly one prompt per line.
    pub async fn send_prompt(&self, prompt: &str) -> Result<()> {
        let mut framed = prompt.replace('\n', "\u{2028}");
        framed.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| RelayError::transport_with("failed to write agent prompt", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| RelayError::transport_with("failed to flush agent stdin", e))?;
        Ok(())
    }

    /// Receive the next fragment of the current reply. `None` means the
    /// process exited. Callers that need to interleave I/O with consumption
    /// (streamed delivery) loop over this instead of [`read_reply`].
    ///
    /// [`read_reply`]: Self::read_reply
    pub async fn next_fragment(&self) -> Option<ReplyFragment> {
        let fragment = self.fragments.lock().await.recv().await;
        if fragment.is_none() {
            self.exited
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        fragment
    }

    /// Consume fragments until the end of the current reply. `on_partial`
    /// fires with each completed paragraph when the caller streams replies;
    /// pass `None` to assemble silently.
    pub async fn read_reply(
        &self,
        mut on_partial: Option<&mut (dyn FnMut(String) + Send)>,
    ) -> Result<ReplyAssembly> {
        let mut rx = self.fragments.lock().await;
        let mut assembly = ReplyAssembly::default();
        let mut paragraph = String::new();

        loop {
            match rx.recv().await {
                Some(ReplyFragment::Text(line)) => {
                    if line.trim().is_empty() && !paragraph.is_empty() {
                        if let Some(cb) = on_partial.as_deref_mut() {
                            cb(paragraph.clone());
                        }
                    }
                    if !assembly.body.is_empty() {
                        assembly.body.push('\n');
                    }
                    assembly.body.push_str(&line);
                    if line.trim().is_empty() {
                        paragraph.clear();
                    } else {
                        if !paragraph.is_empty() {
                            paragraph.push('\n');
                        }
                        paragraph.push_str(&line);
                    }
                }
                Some(ReplyFragment::Media(path)) => assembly.media.push(path),
                Some(ReplyFragment::Tool(event)) => {
                    tracing::debug!("agent tool activity: {event}");
                    assembly.tool_events.push(event);
                }
                Some(ReplyFragment::End) => break,
                None => {
                    assembly.process_exited = true;
                    self.exited
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
            }
        }

        assembly.body = assembly.body.trim().to_string();
        Ok(assembly)
    }

    /// Terminate the process. Idempotent.
    pub async fn kill(&self) {
        self.exited
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!("agent kill: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_line() {
        assert_eq!(
            parse_line("hello there"),
            ReplyFragment::Text("hello there".into())
        );
    }

    #[test]
    fn test_parse_media_marker() {
        assert_eq!(
            parse_line("MEDIA:/tmp/out.png"),
            ReplyFragment::Media(PathBuf::from("/tmp/out.png"))
        );
        assert_eq!(
            parse_line("MEDIA: /tmp/with space.png"),
            ReplyFragment::Media(PathBuf::from("/tmp/with space.png"))
        );
    }

    #[test]
    fn test_parse_media_requires_absolute_path() {
        // A relative path is not a marker; keep it as text.
        assert_eq!(
            parse_line("MEDIA:relative.png"),
            ReplyFragment::Text("MEDIA:relative.png".into())
        );
    }

    #[test]
    fn test_parse_end_marker() {
        assert_eq!(parse_line("EOM"), ReplyFragment::End);
        assert_eq!(parse_line("EOM  "), ReplyFragment::End);
        assert_eq!(
            parse_line("EOM trailing words"),
            ReplyFragment::Text("EOM trailing words".into())
        );
    }

    #[test]
    fn test_parse_tool_marker() {
        assert!(matches!(
            parse_line("📖 Reading src/main.rs"),
            ReplyFragment::Tool(_)
        ));
        assert!(matches!(
            parse_line("🔧 Running tests"),
            ReplyFragment::Tool(_)
        ));
    }

    #[tokio::test]
    async fn test_spawn_echo_agent_and_read_reply() {
        // `cat` echoes the prompt back and exits when stdin closes; the
        // reply ends via process EOF.
        let agent = AgentProcess::spawn(&["cat".to_string()], "").await.unwrap();
        agent.send_prompt("hello agent").await.unwrap();
        // Close stdin by dropping the handle inside kill-free shutdown:
        // instead send EOM through the echo.
        agent.send_prompt(END_MARKER).await.unwrap();
        let reply = agent.read_reply(None).await.unwrap();
        assert_eq!(reply.body, "hello agent");
        assert!(!reply.process_exited);
        agent.kill().await;
    }

    #[tokio::test]
    async fn test_reply_collects_media_and_tools() {
        let script = format!(
            "echo 'line one'; echo '📖 reading'; echo 'MEDIA:/tmp/pic.jpg'; echo '{END_MARKER}'"
        );
        let agent = AgentProcess::spawn(
            &["sh".to_string(), "-c".to_string(), script],
            "",
        )
        .await
        .unwrap();
        let reply = agent.read_reply(None).await.unwrap();
        assert_eq!(reply.body, "line one");
        assert_eq!(reply.media, vec![PathBuf::from("/tmp/pic.jpg")]);
        assert_eq!(reply.tool_events.len(), 1);
        agent.kill().await;
    }

    #[tokio::test]
    async fn test_eof_marks_process_exited() {
        let agent = AgentProcess::spawn(
            &["sh".to_string(), "-c".to_string(), "echo only-line".to_string()],
            "",
        )
        .await
        .unwrap();
        let reply = agent.read_reply(None).await.unwrap();
        assert_eq!(reply.body, "only-line");
        assert!(reply.process_exited);
        assert!(!agent.is_running());
        agent.kill().await;
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = AgentProcess::spawn(&[], "").await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
