//! This is the stream_router crate. It relays data between a fixed set of
//! endpoints (serial ports, TCP clients and servers, UDP sockets and NTRIP
//! casters) according to a link graph that can be edited while the endpoints
//! are running. Every connected endpoint is served by its own tokio task;
//! data moves between tasks only through the per-endpoint inboxes of the
//! [`fabric::LinkFabric`].

pub mod cmdline;
pub mod config;
pub mod error;
pub mod fabric;
pub mod ntrip;
pub mod registry;
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod worker;

pub use config::{PortConfig, RouterConfig};
pub use error::{Error, Result};
pub use fabric::LinkFabric;
pub use registry::{ConfigSource, StreamRegistry};
pub use stream::Stream;
pub use transport::{TransportKind, TransportSettings};
pub use worker::{Direction, ShowData, StreamStatus};
