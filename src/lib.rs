//! # mongo-core
//!
//! The core of a MongoDB driver: the BSON document codec, wire protocol
//! message framing, and server discovery and monitoring.
//!
//! ## Features
//!
//! - BSON encoding and decoding for every element type, with key validation
//! - Legacy opcodes, `OP_MSG` and `OP_COMPRESSED` framing over tokio streams
//! - Background server monitors feeding a topology state machine
//! - Server selection by read preference, tag sets, staleness and latency
//!
//! ## Quick Start
//!
//! ```ignore
//! use mongo_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> mongo_core::Result<()> {
//!     let client = MongoClient::new("mongodb://a:27017,b:27017/?replicaSet=rs0")?;
//!
//!     // Route a read to the nearest member
//!     let reply = client
//!         .run_command("mydb", doc! { "count": "users" }, Some(ReadPreference::nearest().into()))
//!         .await?;
//!     println!("{:?}", reply.get_i32("n"));
//!
//!     // Watch the topology change as members come and go
//!     let mut events = client.cluster().subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod document;
pub mod error;
pub mod options;
pub mod sdam;
pub mod wire;

// Re-export main types
pub use client::{Client, MongoClient};
pub use connection::{Connection, Connector, TcpConnection, TcpConnector};
pub use document::{decode, encode, Document, ObjectId, Value};
pub use error::{ErrorKind, MongoError, Result};
pub use options::{ClientOptions, ClientOptionsBuilder};
pub use sdam::{
    Cluster, ReadPreference, ReadPreferenceMode, SdamEvent, SelectedServer, SelectionCriteria,
    ServerAddress, ServerDescription, ServerType, TopologyDescription, TopologyType,
};
pub use wire::{Message, OpMsg};

/// Prelude module for common imports.
pub mod prelude {
    pub use super::client::{Client, MongoClient};
    pub use super::doc;
    pub use super::document::{Document, ObjectId, Value};
    pub use super::error::{ErrorKind, MongoError, Result};
    pub use super::options::ClientOptions;
    pub use super::sdam::{ReadPreference, SelectionCriteria, ServerAddress};
}

/// Get the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
