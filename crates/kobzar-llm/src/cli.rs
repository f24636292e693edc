//! CLI-driven provider: spawn a command, write the prompt to stdin, read the
//! completion from stdout. A nonzero exit code is a retryable failure — the
//! Switchboard moves on to the next provider.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Role};

pub struct CliProvider {
    name: String,
    command: String,
}

impl CliProvider {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt = format_prompt(req);

        debug!(
            command = %self.command,
            model = %req.model,
            prompt_len = prompt.len(),
            "sending to CLI provider"
        );

        let mut child = tokio::process::Command::new(&self.command)
            .arg("-m")
            .arg(&req.model)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProviderError::Unavailable(format!(
                        "command '{}' not found on PATH",
                        self.command
                    ))
                } else {
                    ProviderError::Unavailable(format!("failed to spawn '{}': {e}", self.command))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Unavailable(format!("stdin write failed: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("process error: {e}")))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Unavailable(format!(
                "'{}' exited with code {code}: {}",
                self.command,
                stderr.trim()
            )));
        }

        let content = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if content.is_empty() {
            return Err(ProviderError::Parse("empty completion on stdout".into()));
        }

        debug!(content_len = content.len(), "CLI provider response received");

        Ok(ChatResponse {
            content,
            model: req.model.clone(),
        })
    }
}

/// Flatten system prompt + conversation into the text handed over on stdin.
fn format_prompt(req: &ChatRequest) -> String {
    let mut out = String::new();
    if !req.system.is_empty() {
        out.push_str(&req.system);
        out.push_str("\n\n");
    }

    if req.messages.len() > 1 {
        out.push_str("[Розмова]\n");
        for msg in &req.messages[..req.messages.len() - 1] {
            let role = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            out.push_str(&format!("{}: {}\n", role, msg.content));
        }
        out.push('\n');
    }

    if let Some(last) = req.messages.last() {
        out.push_str(&last.content);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn prompt_carries_system_and_history() {
        let req = ChatRequest {
            model: "gemini-2.0-flash".into(),
            system: "Ти — Кобзар.".into(),
            messages: vec![
                Message {
                    role: Role::User,
                    content: "привіт".into(),
                },
                Message {
                    role: Role::Assistant,
                    content: "вітаю".into(),
                },
                Message {
                    role: Role::User,
                    content: "що нового?".into(),
                },
            ],
            max_tokens: 512,
            response_schema: None,
        };

        let prompt = format_prompt(&req);
        assert!(prompt.starts_with("Ти — Кобзар."));
        assert!(prompt.contains("User: привіт"));
        assert!(prompt.contains("Assistant: вітаю"));
        assert!(prompt.ends_with("що нового?"));
    }

    #[tokio::test]
    async fn missing_binary_is_retryable() {
        let provider = CliProvider::new("cli_gemini", "definitely-not-a-real-binary-kobzar");
        let err = provider
            .send(&ChatRequest::new("m", "s", "hi"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
