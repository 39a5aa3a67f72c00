//! Client command language
//!
//! One line of user input becomes one [`Command`]. Keywords are upper case
//! and case sensitive.

use std::fmt;

use crate::protocol::{Frame, Request};

/// A parsed line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pub { topic: String, message: String },
    PubRet { topic: String, message: String },
    Sub { pattern: String },
    Unsub { pattern: String },
    List,
    Disconnect,
}

/// Malformed input; nothing is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    Unknown(String),
    Usage(&'static str),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command"),
            CommandError::Unknown(keyword) => write!(
                f,
                "unknown command {:?}, expected PUB, PUBRET, SUB, UNSUB, LIST or DISCONNECT",
                keyword
            ),
            CommandError::Usage(usage) => write!(f, "usage: {}", usage),
        }
    }
}

impl std::error::Error for CommandError {}

const PUB_USAGE: &str = "PUB <topic> <message>";
const PUBRET_USAGE: &str = "PUBRET <topic> <message>";
const SUB_USAGE: &str = "SUB <topic-pattern>";
const UNSUB_USAGE: &str = "UNSUB <topic-pattern>";
const LIST_USAGE: &str = "LIST";
const DISCONNECT_USAGE: &str = "DISCONNECT";

impl Command {
    /// Parse one line of input
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim_start()),
            None => (line, ""),
        };

        match keyword {
            "PUB" => {
                let (topic, message) =
                    topic_and_message(rest).ok_or(CommandError::Usage(PUB_USAGE))?;
                Ok(Command::Pub { topic, message })
            }
            "PUBRET" => {
                let (topic, message) =
                    topic_and_message(rest).ok_or(CommandError::Usage(PUBRET_USAGE))?;
                Ok(Command::PubRet { topic, message })
            }
            "SUB" => single_word(rest)
                .map(|pattern| Command::Sub { pattern })
                .ok_or(CommandError::Usage(SUB_USAGE)),
            "UNSUB" => single_word(rest)
                .map(|pattern| Command::Unsub { pattern })
                .ok_or(CommandError::Usage(UNSUB_USAGE)),
            "LIST" if rest.is_empty() => Ok(Command::List),
            "LIST" => Err(CommandError::Usage(LIST_USAGE)),
            "DISCONNECT" if rest.is_empty() => Ok(Command::Disconnect),
            "DISCONNECT" => Err(CommandError::Usage(DISCONNECT_USAGE)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Frame to send for this command; `None` for DISCONNECT, which runs the
    /// disconnect handshake instead
    pub fn to_frame(&self) -> Option<Frame> {
        match self {
            Command::Pub { topic, message } => {
                Some(Frame::publish(topic.as_str(), message.as_str(), false))
            }
            Command::PubRet { topic, message } => {
                Some(Frame::publish(topic.as_str(), message.as_str(), true))
            }
            Command::Sub { pattern } => Some(Frame::subscribe(pattern.as_str())),
            Command::Unsub { pattern } => Some(Frame::unsubscribe(pattern.as_str())),
            Command::List => Some(Frame::control(Request::List)),
            Command::Disconnect => None,
        }
    }
}

/// `<topic> <message...>`; the message is the rest of the line with one
/// pair of surrounding double quotes removed
fn topic_and_message(rest: &str) -> Option<(String, String)> {
    let (topic, message) = rest.split_once(char::is_whitespace)?;
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    let message = message
        .strip_prefix('"')
        .and_then(|m| m.strip_suffix('"'))
        .unwrap_or(message);
    Some((topic.to_string(), message.to_string()))
}

fn single_word(rest: &str) -> Option<String> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return None;
    }
    Some(rest.to_string())
}
