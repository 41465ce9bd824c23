//! Minimal unary gRPC client over raw HTTP/2.
//!
//! Messages are described at runtime by protobuf descriptor sets and passed
//! in and out as JSON values, so no generated code is needed. The HTTP/2
//! layer is `questwire-h2`, driven by one tokio task per connection.
//!
//! ```text
//!   GrpcClient::call(service, method, request type, response type, payload)
//!        |
//!   +----v-----------+      +----------------+
//!   | SchemaRegistry |      | codec          |  5-byte framing, gzip
//!   +----------------+      +----------------+
//!        |
//!   +----v---------------+
//!   | ConnectionManager  |  lazy connect, one session per client
//!   | driver task        |  questwire-h2 over TCP / TLS
//!   +--------------------+
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use questwire_grpc::{ClientConfig, Credential, GrpcClient, SchemaRegistry, SchemaSource};
//! use serde_json::json;
//!
//! # async fn run() -> questwire_grpc::Result<()> {
//! let schema = SchemaRegistry::load([SchemaSource::File("game.desc".into())])?;
//! let config = ClientConfig::from_url("https://game.example.com")?
//!     .credential(Credential::bearer("token")?);
//! let client = GrpcClient::new(config, schema)?;
//!
//! let quests = client
//!     .call("game.QuestService", "List", "game.Empty", "game.QuestList", &json!({}))
//!     .await?;
//! println!("{quests}");
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod metadata;
pub mod schema;
mod transport;

pub use call::{CallState, PendingCall};
pub use client::{GrpcClient, RequestSpec};
pub use config::{ClientConfig, Credential, Scheme};
pub use connection::{ConnectionManager, Session};
pub use error::{Error, GrpcStatus, ProtocolError, Result, TransportError};
pub use questwire_h2::Settings;
pub use schema::{SchemaRegistry, SchemaSource};
