//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use remora_fabric::ConnParam;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 20886;

/// Everything tunable about the server. `Default` reproduces the classic
/// geometry: a 4 KiB data buffer in 64-byte blocks.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: IpAddr,
    /// Port to listen on.
    pub port: u16,

    /// Completion queue capacity.
    pub cq_capacity: usize,
    /// Maximum outstanding work requests per queue.
    pub max_wr: u32,
    /// Maximum scatter/gather entries per request.
    pub max_sge: u32,
    /// Parameters granted on accept.
    pub conn_param: ConnParam,

    /// Size of the shared data buffer in bytes.
    pub data_size: u32,
    /// Block granularity of the mapping table. Must divide `data_size`.
    pub block_size: u32,
    /// Data-area capacity of the per-connection segment.
    pub segment_capacity: usize,
    /// Directory for segment backing files.
    pub segment_dir: PathBuf,

    /// Upper bound on each completion wait during the handshake.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            cq_capacity: 16,
            max_wr: 8,
            max_sge: 2,
            conn_param: ConnParam::default(),
            data_size: 4096,
            block_size: 64,
            segment_capacity: 64 * 1024,
            segment_dir: std::env::temp_dir(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// The socket address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr().port(), DEFAULT_PORT);
        assert_eq!(config.data_size % config.block_size, 0);
        // Data, mapping table, and message buffers all fit in the segment.
        let table = 8 * (config.data_size / config.block_size);
        assert!((config.data_size + table) as usize <= config.segment_capacity);
    }
}
