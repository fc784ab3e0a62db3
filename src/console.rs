//! Line commands and text rendering for the terminal front-end.

use std::fmt::Write;
use thiserror::Error;

use crate::api::DeviceId;
use crate::devices::AgentState;
use crate::session::{DeviceSnapshot, DeviceUpdate};

pub const HELP: &str = "\
commands:
  <device-id> <topic> <value> [retain]   publish a command
  <device-id> <topic> - [retain]         publish the pending input
  input <device-id> <text>               set the pending input
  show                                   print all devices
  quit                                   shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Publish {
        device_id: DeviceId,
        topic: String,
        /// `None` sends the pending input.
        message: Option<String>,
        retain: bool,
    },
    SetInput {
        device_id: DeviceId,
        text: String,
    },
    Show,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected `input <device-id> <text>`")]
    InputUsage,

    #[error("expected `<device-id> <topic> <value> [retain]`")]
    PublishUsage,

    #[error("unexpected argument {0:?}, only `retain` may follow the value")]
    TrailingArgument(String),
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(None);
        };

        let command = match first {
            "show" | "ls" => ConsoleCommand::Show,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            "input" => {
                let device_id = words.next().ok_or(ParseError::InputUsage)?;
                let text = words.collect::<Vec<_>>().join(" ");
                ConsoleCommand::SetInput {
                    device_id: DeviceId::from(device_id),
                    text,
                }
            }
            device_id => {
                let topic = words.next().ok_or(ParseError::PublishUsage)?;
                let value = words.next().ok_or(ParseError::PublishUsage)?;
                let retain = match words.next() {
                    None => false,
                    Some("retain") => true,
                    Some(other) => return Err(ParseError::TrailingArgument(other.to_string())),
                };
                if let Some(extra) = words.next() {
                    return Err(ParseError::TrailingArgument(extra.to_string()));
                }
                ConsoleCommand::Publish {
                    device_id: DeviceId::from(device_id),
                    topic: topic.to_string(),
                    message: (value != "-").then(|| value.to_string()),
                    retain,
                }
            }
        };
        Ok(Some(command))
    }
}

pub fn render_update(update: &DeviceUpdate) -> String {
    format!(
        "{} [{}] {} = {}",
        update.updated_at.format("%H:%M:%S"),
        update.device_id,
        update.topic,
        update.display
    )
}

pub fn render_snapshot(devices: &[DeviceSnapshot]) -> String {
    if devices.is_empty() {
        return "no devices".to_string();
    }

    let mut out = String::new();
    for snapshot in devices {
        let device = &snapshot.device;
        let kind = snapshot
            .type_name
            .clone()
            .unwrap_or_else(|| format!("type {}", device.device_type));
        let _ = write!(out, "[{}] {} ({})", device.id, device.name, kind);
        if let Some(room) = &device.room {
            let _ = write!(out, " in {}", room);
        }
        match snapshot.state {
            AgentState::Registered => out.push_str(" loading..."),
            AgentState::Failed => out.push_str(" unavailable"),
            AgentState::Loaded => {}
        }
        out.push('\n');

        for (topic, state) in &snapshot.topics {
            let marker = if state.writable { "rw" } else { "r " };
            let value = state.display().unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "  {} {} {}", marker, topic, value);
        }
        if !snapshot.pending_input.is_empty() {
            let _ = writeln!(out, "  input: {}", snapshot.pending_input);
        }
    }
    out.trim_end().to_string()
}
