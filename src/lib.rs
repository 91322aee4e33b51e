//! # NSQ Rust Client
//!
//! A Rust client library for [NSQ](https://nsq.io), a realtime distributed messaging platform.
//!
//! The crate provides a [`Reader`] that consumes a topic/channel from any number of
//! `nsqd` daemons, found directly or through `nsqlookupd`, and a [`Writer`] that
//! publishes to a single daemon. Both speak the NSQ V2 TCP protocol, including TLS,
//! DEFLATE and Snappy upgrades and authentication.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nsq_client::{Reader, ReaderConfigBuilder, ReaderEvent, Writer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Publish a message
//!     let mut writer = Writer::new("localhost", 4150)?;
//!     writer.connect().await?;
//!     writer.publish("events", ["Hello, NSQ!"]).await?;
//!
//!     // Consume it
//!     let config = ReaderConfigBuilder::new()
//!         .nsqd_tcp_address("localhost:4150")
//!         .max_in_flight(5)
//!         .build();
//!     let mut reader = Reader::new("events", "archive", config)?;
//!     reader.connect().await?;
//!
//!     while let Some(event) = reader.next_event().await {
//!         if let ReaderEvent::Message(message) = event {
//!             println!("Message: {}", String::from_utf8_lossy(message.body()));
//!             message.finish()?;
//!             break;
//!         }
//!     }
//!
//!     reader.close().await;
//!     writer.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Flow control** - `max_in_flight` is shared across all daemons and rebalanced as
//!   connections come and go
//! - **Backoff** - requeues flagged as failures throttle the reader with jittered
//!   exponential backoff, recovering one trial message at a time
//! - **Discovery** - static daemon lists or `nsqlookupd` polling with fail-open
//!   address retention
//! - **Exactly one response** - every [`Message`] is finished, requeued or timed out once
//! - **Transport** - TLS via `rustls`, DEFLATE and Snappy stream compression, AUTH
//! - **Error handling** - one [`NsqError`] type with retryable and fatal classification
//!
//! ## Configuration
//!
//! Use [`ReaderConfigBuilder`] and [`WriterConfigBuilder`]:
//!
//! ```no_run
//! use nsq_client::{Compression, Reader, ReaderConfigBuilder};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), nsq_client::NsqError> {
//! let config = ReaderConfigBuilder::new()
//!     .lookupd_http_addresses(["lookupd-1:4161", "lookupd-2:4161"])
//!     .max_in_flight(100)
//!     .max_attempts(5)
//!     .max_backoff_duration(Duration::from_secs(60))
//!     .compression(Compression::Snappy)
//!     .build();
//! let mut reader = Reader::new("events", "archive", config)?;
//! reader.on_discard(|message| eprintln!("giving up on {}", message.id()));
//! # Ok(())
//! # }
//! ```

mod backoff;
pub mod compression;
pub mod config;
pub mod connection;
mod discovery;
pub mod error;
pub mod message;
mod pool;
pub mod protocol;
mod reader;
mod ready;
mod retry;
mod tls;
mod writer;

pub use config::{
    Compression, ConnectionConfig, ReaderConfig, ReaderConfigBuilder, WriterConfig,
    WriterConfigBuilder,
};
pub use error::{NsqError, Result};
pub use message::{DiscardHandler, Message, MessageState};
pub use protocol::MessageId;
pub use reader::{Reader, ReaderEvent};
pub use writer::{Writer, WriterEvent};
