//! Wire protocol between the broker and its clients.
//!
//! Communication uses fixed-layout binary frames over a Unix domain socket,
//! one request per reply:
//!
//! ```text
//! Client                          Broker
//!   |                               |
//!   |-- Install{vid,pid} ---------->|
//!   |                               | (policy check, driver install)
//!   |<-- Reply{status} -------------|
//!   |                               |
//! ```
//!
//! Every frame starts with an 8-byte header `{magic, version, type, size}`,
//! all fields little-endian `u16`. A frame whose magic, version, or declared
//! size does not match is rejected outright and the connection is closed
//! without a reply.

pub mod client;
pub mod codec;

pub use client::{BrokerClient, ClientError};
pub use codec::{Message, ProtocolError};

/// Default socket path for the broker endpoint.
pub const DEFAULT_SOCKET_PATH: &str = "/run/usb-broker.sock";

/// Protocol magic, first header field of every frame.
pub const PROTOCOL_MAGIC: u16 = 0xDADA;

/// Protocol version accepted by this broker.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Upper bound on a single framed request.
pub const MAX_FRAME_SIZE: usize = 1024;
