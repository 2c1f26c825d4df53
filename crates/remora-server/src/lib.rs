//! remora-server: a single-connection remote-memory channel server.
//!
//! The server accepts one client, proves liveness with a counter echo,
//! builds a block-structured memory region, and hands the client a
//! descriptor for it. From then on the client works the region directly
//! through the shared mapping; the server's last job is tearing
//! everything down when the client leaves.

pub mod config;
pub mod error;
pub mod machine;
pub mod poller;
pub mod protocol;
pub mod region;
pub mod resources;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::ServerError;
pub use machine::{ConnState, Connection, Server};
