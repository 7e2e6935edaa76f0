//! framelink — message-framed TCP transport with TLS, preshared-key
//! authentication, and synchronous request/response correlation.
//!
//! A symmetric client/server pair exchanges discrete messages over one
//! long-lived connection. Every message is a UTF-8 JSON header (delimited by
//! two consecutive line terminators) followed by exactly `ContentLength`
//! payload bytes. Payloads are delivered to the application either fully
//! buffered or, above a configurable threshold, as a bounded stream read
//! directly off the transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{ClientConfig, LinkClient, LinkServer, ServerConfig, ServerHandler};
//!
//! struct Echo;
//! impl ServerHandler for Echo {}
//!
//! # async fn run() -> framelink::LinkResult<()> {
//! let server = LinkServer::new(ServerConfig::default(), Arc::new(Echo))?;
//! server.start().await?;
//!
//! struct Quiet;
//! impl framelink::ClientHandler for Quiet {}
//!
//! let client = LinkClient::connect(ClientConfig::default(), Arc::new(Quiet)).await?;
//! client.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod cert;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod message;
pub mod server;
pub mod stats;
pub mod sync;
pub mod tls;
pub mod transport;

mod receiver;
mod registry;
mod sender;
mod session;

pub use client::LinkClient;
pub use config::{ClientConfig, ServerConfig, TlsSettings};
pub use error::{DisconnectReason, FramingError, LinkError, LinkResult, SyncError};
pub use frame::BoundedBody;
pub use handler::{ClientHandler, ServerHandler};
pub use message::{
    InboundMessage, MessageStatus, Metadata, SyncRequest, SyncResponse,
};
pub use server::LinkServer;
pub use stats::{LinkStatistics, StatisticsSnapshot};
