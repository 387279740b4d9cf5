use palaver_core::{
    ChatEngine, EngineError, SendAvailability, StopReason, TranscriptEvent,
};
use palaver_storage::{DeliveryStatus, Message};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

pub const DEFAULT_AGENT_LABEL: &str = "agent";

const HELP: &str = "commands: /consent  /decline  /reset  /help  /quit";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Consent,
    Decline,
    Reset,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    match line {
        "/consent" | "/accept" => Command::Consent,
        "/decline" => Command::Decline,
        "/reset" | "/new" => Command::Reset,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other if other.starts_with('/') => Command::Unknown(other.to_string()),
        other => Command::Send(other.to_string()),
    }
}

/// Turns transcript events into terminal lines.
///
/// A message is printed once it is final. The rendered flag in the store remembers what was
/// already shown, so a full rebuild prints the history again.
#[derive(Debug)]
pub struct TranscriptPrinter {
    agent_label: String,
    typing_shown: bool,
    availability: Option<SendAvailability>,
}

impl TranscriptPrinter {
    pub fn new(agent_label: impl Into<String>) -> Self {
        Self {
            agent_label: agent_label.into(),
            typing_shown: false,
            availability: None,
        }
    }

    pub fn lines_for(&mut self, engine: &ChatEngine, event: &TranscriptEvent) -> Vec<String> {
        match event {
            TranscriptEvent::MessageAdded { index } | TranscriptEvent::MessageUpdated { index } => {
                self.message_line(engine, *index).into_iter().collect()
            }
            TranscriptEvent::MessageRemoved { .. } => Vec::new(),
            TranscriptEvent::Cleared => {
                self.typing_shown = false;
                vec!["--- conversation cleared ---".to_string()]
            }
            TranscriptEvent::StateChanged(status) => {
                let mut lines = Vec::new();
                if status.awaiting_agent && !self.typing_shown {
                    lines.push(format!("({} is typing...)", self.agent_label));
                }
                self.typing_shown = status.awaiting_agent;

                if self.availability != Some(status.availability) {
                    self.availability = Some(status.availability);
                    lines.extend(availability_line(status.availability));
                }
                lines
            }
            TranscriptEvent::PollingStopped { reason } => match reason {
                StopReason::SessionExpired => {
                    vec!["(session expired, starting a new conversation)".to_string()]
                }
                _ => Vec::new(),
            },
        }
    }

    fn message_line(&self, engine: &ChatEngine, index: usize) -> Option<String> {
        if engine.is_rendered(index) {
            return None;
        }
        let message = engine.message(index)?;
        let (line, done) = self.format_message(&message);
        if done {
            engine.mark_rendered(index, true);
        }
        line
    }

    /// Returns the line to print and whether the message needs no further output.
    fn format_message(&self, message: &Message) -> (Option<String>, bool) {
        if message.is_local_notice() {
            return (Some(format!("! {}", message.content)), true);
        }

        if message.is_user() {
            return match message.status {
                Some(DeliveryStatus::Pending) => (None, false),
                Some(DeliveryStatus::Failed) => {
                    (Some(format!("x not delivered: {}", message.content)), true)
                }
                _ => (Some(format!("you> {}", message.content)), true),
            };
        }

        if message.is_streaming_placeholder || message.content.trim().is_empty() {
            return (None, false);
        }

        let line = if message.is_tool_call {
            format!("[{}] {}", self.agent_label, message.content)
        } else {
            format!("{}> {}", self.agent_label, message.content)
        };
        (Some(line), true)
    }
}

fn availability_line(availability: SendAvailability) -> Option<String> {
    match availability {
        SendAvailability::ConsentPending => Some(
            "Please accept the privacy notice with /consent before chatting, or /decline."
                .to_string(),
        ),
        SendAvailability::Terminated => {
            Some("The conversation has ended. Type /reset to start over.".to_string())
        }
        SendAvailability::Ready | SendAvailability::AwaitingAgent => None,
    }
}

pub struct TerminalApp {
    engine: ChatEngine,
    events: UnboundedReceiver<TranscriptEvent>,
    printer: TranscriptPrinter,
}

impl TerminalApp {
    pub fn new(
        engine: ChatEngine,
        events: UnboundedReceiver<TranscriptEvent>,
        agent_label: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            events,
            printer: TranscriptPrinter::new(agent_label),
        }
    }

    pub async fn run(mut self) -> AppResult<()> {
        println!("{HELP}");
        let availability = self.engine.send_availability();
        self.printer.availability = Some(availability);
        if let Some(line) = availability_line(availability) {
            println!("{line}");
        }

        if self.engine.resume().await {
            tracing::info!(
                session_id = ?self.engine.client().session_id(),
                "resumed conversation"
            );
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-terminal-input" })?;
                    let Some(line) = line else {
                        break;
                    };
                    if !self.handle(parse_command(&line)) {
                        break;
                    }
                }
                Some(event) = self.events.recv() => {
                    for line in self.printer.lines_for(&self.engine, &event) {
                        println!("{line}");
                    }
                }
            }
        }

        self.engine.stop_polling();
        Ok(())
    }

    /// Returns false once the user asked to leave.
    fn handle(&self, command: Command) -> bool {
        match command {
            Command::Send(text) => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    match engine.send(&text).await {
                        Ok(()) => {}
                        Err(EngineError::SendUnavailable { availability, .. }) => {
                            let hint = availability_line(availability).unwrap_or_else(|| {
                                "Please wait for the current reply to finish.".to_string()
                            });
                            println!("{hint}");
                        }
                        Err(error) => {
                            tracing::warn!(status = ?error.status(), error = %error, "message was not delivered");
                        }
                    }
                });
            }
            Command::Consent => self.engine.grant_consent(),
            Command::Decline => self.engine.decline_consent(),
            Command::Reset => self.engine.reset(),
            Command::Help => println!("{HELP}"),
            Command::Unknown(command) => println!("unknown command {command}. {HELP}"),
            Command::Empty => {}
            Command::Quit => return false,
        }
        true
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palaver_client::{DemoTransport, ServiceConfig, SessionClient};
    use palaver_core::{EngineConfig, EngineStatus};
    use palaver_storage::{MemoryPersistence, MessageRole};
    use pretty_assertions::assert_eq;

    use super::*;

    fn printer() -> TranscriptPrinter {
        TranscriptPrinter::new(DEFAULT_AGENT_LABEL)
    }

    fn demo_engine(config: EngineConfig) -> (ChatEngine, UnboundedReceiver<TranscriptEvent>) {
        let client = SessionClient::new(
            ServiceConfig::default(),
            Arc::new(DemoTransport::new(vec!["Guten Tag".to_string()])),
            Arc::new(MemoryPersistence::new()),
        );
        ChatEngine::new(config, client)
    }

    #[test]
    fn commands_are_recognized() {
        assert_eq!(parse_command("  /consent "), Command::Consent);
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert_eq!(parse_command("/nope"), Command::Unknown("/nope".to_string()));
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command(" Hallo "), Command::Send("Hallo".to_string()));
    }

    #[test]
    fn messages_are_formatted_once_final() {
        let printer = printer();

        let mut streaming = Message::new(MessageRole::Agent, "Hal");
        streaming.is_streaming_placeholder = true;
        assert_eq!(printer.format_message(&streaming), (None, false));

        let answer = Message::new(MessageRole::Agent, "Hallo");
        assert_eq!(
            printer.format_message(&answer),
            (Some("agent> Hallo".to_string()), true)
        );

        let mut failed = Message::user_pending("Hi");
        failed.status = Some(DeliveryStatus::Failed);
        assert_eq!(
            printer.format_message(&failed),
            (Some("x not delivered: Hi".to_string()), true)
        );

        assert_eq!(
            printer.format_message(&Message::user_pending("Hi")),
            (None, false)
        );
        assert_eq!(
            printer.format_message(&Message::local_notice("Offline")),
            (Some("! Offline".to_string()), true)
        );
    }

    #[tokio::test]
    async fn typing_and_consent_lines_follow_state_changes() {
        let (engine, _events) = demo_engine(EngineConfig::default());
        let mut printer = printer();
        let status = |awaiting_agent, availability| {
            TranscriptEvent::StateChanged(EngineStatus {
                awaiting_agent,
                availability,
                tool_call_anchor: None,
                typing_anchor: None,
            })
        };

        let lines = printer.lines_for(&engine, &status(false, SendAvailability::ConsentPending));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("/consent"));

        let lines = printer.lines_for(&engine, &status(true, SendAvailability::AwaitingAgent));
        assert_eq!(lines, vec!["(agent is typing...)".to_string()]);
        assert!(
            printer
                .lines_for(&engine, &status(true, SendAvailability::AwaitingAgent))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn demo_reply_is_printed_after_streaming_finishes() {
        let (engine, mut events) = demo_engine(EngineConfig::default());
        let mut printer = printer();

        engine.send("Hallo").await.unwrap();

        let mut printed = Vec::new();
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .expect("demo reply finished in time")
                .expect("engine is alive");
            printed.extend(printer.lines_for(&engine, &event));
            if event
                == (TranscriptEvent::PollingStopped {
                    reason: StopReason::Idle,
                })
            {
                break;
            }
        }

        assert!(printed.contains(&"you> Hallo".to_string()));
        assert!(printed.contains(&"agent> Guten Tag".to_string()));
        assert_eq!(
            printed.iter().filter(|line| line.starts_with("agent>")).count(),
            1
        );
    }
}
