//! Log Collector Library
//!
//! Pulls append-only log batches from a fleet of HTTP endpoints and forwards
//! every line, enriched, to an ingestion sink with at-least-once delivery and
//! crash-safe resume.
//!
//! - **config**: Environment-based configuration
//! - **endpoint**: Endpoint/batch descriptors and the discovery protocol
//! - **framer**: Newline framing and envelope enrichment
//! - **offset_store**: Durable per-batch delivered-byte ledger
//! - **client**: Sink trait and its HTTP implementation
//! - **delivery**: Delivery with a FIFO retry queue
//! - **streamer**: Resumable, backpressured batch streaming
//! - **pod**: Per-endpoint collection worker
//! - **directory**: Sources of the desired endpoint set
//! - **supervisor**: Fleet reconciliation
//! - **stats**: Pod counters and the fleet stats surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use log_collector::config::Config;
//! use log_collector::client::SinkClient;
//! use log_collector::directory::StaticDirectory;
//! use log_collector::endpoint::Endpoint;
//! use log_collector::supervisor::FleetSupervisor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let sink = Arc::new(SinkClient::new(&config)?);
//!     let directory = Arc::new(StaticDirectory::new(vec![Endpoint::new(
//!         "http://10.0.0.1:8666/logs/chain-42",
//!         "chain-42",
//!     )]));
//!
//!     let supervisor = FleetSupervisor::new(config, directory, sink)?;
//!     supervisor.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod endpoint;
pub mod error;
pub mod framer;
pub mod offset_store;
pub mod pod;
pub mod stats;
pub mod streamer;
pub mod supervisor;

pub use client::{LogSink, SinkClient, SinkError};
pub use config::{Config, ConfigError, PodConfig};
pub use directory::{EndpointDirectory, StaticDirectory, StatusDirectory};
pub use endpoint::{BatchDescriptor, Endpoint};
pub use error::CollectorError;
pub use pod::{Pod, PodHandle};
pub use stats::{FleetStats, Lifecycle, PodReport};
pub use supervisor::{FleetState, FleetSupervisor};
