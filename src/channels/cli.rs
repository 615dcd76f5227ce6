//! CLI channel — stdin/stdout REPL for local testing.
//!
//! A line `<phone>: <text>` speaks as that user; any other line speaks as the
//! configured default user. Lines starting with `/` are passed through
//! untouched for the binary to treat as commands.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, MessageStream};
use crate::error::ChannelError;
use crate::intake::{OutgoingReply, TurnRequest};

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel {
    default_user: String,
}

impl CliChannel {
    pub fn new(default_user: impl Into<String>) -> Self {
        Self {
            default_user: default_user.into(),
        }
    }
}

/// Split a REPL line into a turn request. Blank lines yield `None`.
pub fn parse_line(line: &str, default_user: &str) -> Option<TurnRequest> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some((prefix, text)) = line.split_once(':') {
        let phone = prefix.trim();
        let digits = phone.strip_prefix('+').unwrap_or(phone);
        let text = text.trim();
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
            return Some(TurnRequest::new(phone, text));
        }
    }

    Some(TurnRequest::new(default_user, line))
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let default_user = self.default_user.clone();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(request) = parse_line(&line, &default_user) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        request: &TurnRequest,
        reply: OutgoingReply,
    ) -> Result<(), ChannelError> {
        if request.user_id == self.default_user {
            println!("\n{}\n", reply.reply_text);
        } else {
            println!("\n[{}] {}\n", reply.user_id, reply.reply_text);
        }
        eprint!("> ");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_uses_default_user() {
        let request = parse_line("  Hola  ", "local-user").unwrap();
        assert_eq!(request.user_id, "local-user");
        assert_eq!(request.text, "Hola");
    }

    #[test]
    fn phone_prefix_selects_user() {
        let request = parse_line("5491112345678: En dos meses", "local-user").unwrap();
        assert_eq!(request.user_id, "5491112345678");
        assert_eq!(request.text, "En dos meses");

        let request = parse_line("+34600111222: Sí", "local-user").unwrap();
        assert_eq!(request.user_id, "+34600111222");
    }

    #[test]
    fn colon_in_ordinary_text_is_kept() {
        let request = parse_line("Nota: se llama Firulais", "local-user").unwrap();
        assert_eq!(request.user_id, "local-user");
        assert_eq!(request.text, "Nota: se llama Firulais");

        let request = parse_line("123:", "local-user").unwrap();
        assert_eq!(request.user_id, "local-user");
    }

    #[test]
    fn blank_and_commands() {
        assert!(parse_line("   ", "u").is_none());
        assert_eq!(parse_line("/reset", "u").unwrap().text, "/reset");
    }
}
