//! DKG message relay
//!
//! In-process pub/sub hub for operators taking part in distributed key
//! generation. Operators register an HTTP address, publish signed protocol
//! messages to a per-run topic, and the relay fans each message out to every
//! other member of that topic by POSTing it to their `/consume` endpoint.
//!
//! ## Flow
//!
//! - `publish` puts the payload on the bounded inbound queue
//! - the dispatcher decodes the sender and copies the payload onto each other
//!   member's outbound queue
//! - each member's egress worker delivers its queue, retrying failures with a
//!   linear backoff until the retry budget is spent
//!
//! Terminal run results are written to the [`ResultStore`] separately and
//! polled by clients.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dkg_relay::{Relay, RelayConfig};
//!
//! let relay = Relay::start(RelayConfig::default()).await?;
//! relay.register_node("default", "1", "http://10.0.0.1:8080").await?;
//! relay.create_topic("abc123", &["1".into(), "2".into()]).await?;
//! relay.publish("abc123", payload).await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod error;
pub mod message;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod store;
pub mod telemetry;

pub use config::{RelayConfig, DEFAULT_TOPIC};
pub use error::{RelayError, Result};
pub use message::{decode_route, Message, OperatorId, RouteInfo, SignedMessage};
pub use registry::{SubscriberView, TopicView};
pub use relay::{Relay, RegistrationStatus};
pub use store::{ResultStore, RunResult, StoredResult};

/// Relay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
