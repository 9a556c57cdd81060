//! Application layer: orchestration and observability
//!
//! The proxy owns the accept loop; each connection gets a stream context
//! and runs on its own task. Events fan out to the configured observers.

pub mod events;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod stream_context;

pub use events::{Event, EventObserver, EventStream};
pub use metrics::PrometheusObserver;
pub use proxy::Proxy;
pub use stream_context::StreamContext;
