pub mod aggregator;
pub mod config;
pub mod generator;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use aggregator::{Aggregator, AggregatorHandle, HeightState};
pub use config::Config;
pub use generator::{Generator, RoutingConfiguration};
pub use metrics::MetricsCollector;
pub use monitor::{HeadMonitor, HeadSink, HttpReporter};
pub use publisher::{ChannelPublisher, ConfigPublisher, ConfigReceiver};
pub use registry::Registry;
pub use shutdown::Shutdown;
