//! # MeshHub
//!
//! Hubs that find each other, publish shared interfaces and call into each
//! other's implementations across relay hops.
//!
//! ## Architecture
//!
//! - `transport`: length-prefixed frames over TCP or any byte stream.
//! - `packet`: the one-byte-tagged protocol packets.
//! - `connection`: per-session state machine, outbound queue and leasing.
//! - `topology`: remote hubs and their connections grouped by hop distance.
//! - `interface`: local implementations and remote provider links.
//! - `hub`: the public surface; `dispatch` runs each connection's worker.
//! - `awaiter`, `normalize`, `stream`: call correlation, result shaping and
//!   remote byte streams.

pub mod awaiter;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod hub;
pub mod interface;
pub mod mock_transport;
pub mod normalize;
pub mod packet;
pub mod stream;
pub mod topology;
pub mod transport;

mod dispatch;

#[cfg(test)]
mod tests;

pub use config::HubBuilder;
pub use config::HubConfig;
pub use config::ReconnectPolicy;
pub use connection::Connection;
pub use connection::ConnectionInfo;
pub use connection::ConnectionState;
pub use error::Error;
pub use error::Result;
pub use handle::InterfaceHandle;
pub use handle::Target;
pub use hub::Hub;
pub use interface::InterfaceInfo;
pub use packet::HubId;
pub use packet::InterfaceLink;
pub use stream::ExposedStream;
pub use stream::MemoryStream;
pub use stream::RemoteStreamHandle;
pub use stream::StreamInfo;
pub use stream::StreamToken;
pub use topology::RemoteHubInfo;
pub use transport::StreamTransport;
pub use transport::Transport;
