//! Wire protocol definitions
//!
//! Every exchange between a client and the broker is a single fixed-size
//! frame made of three null-padded text fields: a request code, a topic
//! and a message body. The frame size is known to both ends, so there is
//! no length prefix.

mod error;

pub use error::DecodeError;

use std::fmt;

/// Total size of a frame on the wire
pub const FRAME_SIZE: usize = 1024;
/// Width of the request field
pub const REQUEST_SIZE: usize = 128;
/// Width of the topic field
pub const TOPIC_SIZE: usize = 128;
/// Width of the message field
pub const MESSAGE_SIZE: usize = 768;

const _: () = assert!(REQUEST_SIZE + TOPIC_SIZE + MESSAGE_SIZE == FRAME_SIZE);

/// Request codes carried in the first frame field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    /// Client asks to open a session
    Conn,
    /// Broker accepts the session
    ConnAck,
    /// Either side asks to close the session
    Disc,
    /// Acknowledges a DISC
    DiscAck,
    /// Publish without retaining
    Pub,
    /// Publish and retain on every matched topic
    PubRet,
    /// Subscribe to a topic pattern
    Sub,
    /// Unsubscribe from a topic pattern
    Unsub,
    /// List subscribed topics (request and reply)
    List,
    /// Anything else seen on the wire
    Unknown(String),
}

impl Request {
    /// Parse a request code as it appears in the request field
    pub fn parse(s: &str) -> Self {
        match s {
            "CONN" => Request::Conn,
            "CONN_ACK" => Request::ConnAck,
            "DISC" => Request::Disc,
            "DISC_ACK" => Request::DiscAck,
            "PUB" => Request::Pub,
            "PUBRET" => Request::PubRet,
            "SUB" => Request::Sub,
            "UNSUB" => Request::Unsub,
            "LIST" => Request::List,
            other => Request::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Request::Conn => "CONN",
            Request::ConnAck => "CONN_ACK",
            Request::Disc => "DISC",
            Request::DiscAck => "DISC_ACK",
            Request::Pub => "PUB",
            Request::PubRet => "PUBRET",
            Request::Sub => "SUB",
            Request::Unsub => "UNSUB",
            Request::List => "LIST",
            Request::Unknown(s) => s,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request: Request,
    pub topic: String,
    pub message: String,
}

impl Frame {
    pub fn new(request: Request, topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request,
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Frame with only the request field set (CONN, DISC, acks, LIST)
    pub fn control(request: Request) -> Self {
        Self::new(request, String::new(), String::new())
    }

    pub fn publish(topic: impl Into<String>, message: impl Into<String>, retain: bool) -> Self {
        let request = if retain { Request::PubRet } else { Request::Pub };
        Self::new(request, topic, message)
    }

    pub fn subscribe(pattern: impl Into<String>) -> Self {
        Self::new(Request::Sub, pattern, String::new())
    }

    pub fn unsubscribe(pattern: impl Into<String>) -> Self {
        Self::new(Request::Unsub, pattern, String::new())
    }
}
