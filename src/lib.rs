//! # Geoshare - Live Location Relay
//!
//! Participants report their own coordinates and receive a continuously
//! updated view of everyone else's.
//!
//! ## Components
//!
//! - **Relay hub**: fans every `locationUpdate` out to all other connections, keeps no history
//! - **Transport channel**: named-event link to the relay (WebSocket or in-process)
//! - **Location table**: last-observed-wins merge of inbound samples, one entry per participant
//! - **Location source**: live sensor queries or a synthetic generator on a timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use geoshare::{ParticipantConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ParticipantConfig::new("alice", "ws://127.0.0.1:3000/ws");
//!     let session = Session::join(&config).await?;
//!
//!     for sample in session.snapshot() {
//!         println!("{} at ({}, {})", sample.id, sample.lat, sample.lng);
//!     }
//!
//!     session.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod location;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod source;
pub mod store;
pub mod transport;

// Re-export main types for library consumers
pub use config::{GeoshareConfig, ParticipantConfig, RelayConfig, SourceConfig};
pub use error::{GeoError, RetryPolicy};
pub use location::{Coordinates, LocationSample, ParticipantId, LOCATION_UPDATE};
pub use relay::{EchoPolicy, RelayHub};
pub use session::Session;
pub use source::{LocationSource, PositionSensor, SourceMode};
pub use store::{ApplyOutcome, LocationTable};
pub use transport::Channel;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
