//! Message model, configuration, transport contracts, and the
//! forwarding and shutdown machinery. The daemon, the transport adapters and
//! the health endpoint all depend on this one.

pub mod config;
pub mod error;
pub mod health;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod shutdown;
pub mod stats;
pub mod transport;

pub use config::{ConfigError, ForwarderConfig};
pub use error::ForwardError;
pub use health::HealthState;
pub use message::{destination, Message, QualityLevel};
pub use pipeline::{ForwardSettings, Pipeline};
pub use shutdown::{ExitReason, Lifecycle, Resources, Shutdown, Signal};
pub use stats::ForwardStats;
pub use transport::{HealthEndpoint, Sink, Source};
