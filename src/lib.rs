//! PerchMQ - lightweight fixed-frame publish/subscribe broker
//!
//! Clients exchange fixed-size frames with the broker over TCP, subscribe to
//! hierarchical topics with `+` and `#` wildcards, publish to them and may
//! retain the last message on a topic for late subscribers.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod topic;

pub use broker::{Broker, BrokerConfig, MessageRouter, RouterError};
pub use client::{Client, ClientOptions, Command, Delivery};
pub use config::Config;
pub use protocol::{Frame, Request};
pub use session::{ConnectionError, RetryPolicy, SessionState};
