//! # Courier HTTP
//!
//! HTTP side of the courier fabric:
//!
//! - the bridge endpoint (`POST /messages`) that validates envelopes, stamps
//!   `created_at` and republishes them on pub/sub;
//! - [`HttpSender`], the point-to-point [`Sender`](courier_mesh::Sender);
//! - [`ForwardingSubscriber`], which carries envelopes from pub/sub back out
//!   to remote agents over HTTP;
//! - environment-driven [`BridgeConfig`] and the [`BridgeServer`] that ties
//!   them together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_http::{BridgeConfigBuilder, BridgeServer, shutdown_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::from_env()?.build()?;
//!     let server = BridgeServer::connect(config).await?;
//!     let listener = server.bind().await?;
//!     server.serve(listener, shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod forward;
pub mod sender;
pub mod server;
pub mod shutdown;

pub use bridge::{BridgeCounters, BridgeMetrics, BridgeState, router};
pub use config::{BridgeConfig, BridgeConfigBuilder, ConfigError, ForwardTarget};
pub use error::{BridgeError, BridgeErrorKind, ErrorCode, ErrorResponse, RequestId};
pub use forward::ForwardingSubscriber;
pub use sender::{DEFAULT_TIMEOUT, HttpSender, build_client};
pub use server::{BridgeServer, ServerError, connect_transport};
pub use shutdown::shutdown_signal;
