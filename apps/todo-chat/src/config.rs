use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::retention::RetentionConfig;

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub retention: RetentionConfig,
    /// Frames queued per connection before new pushes are dropped.
    pub outbound_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            retention: RetentionConfig::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub static_dir: Option<PathBuf>,
    pub shutdown_grace: Duration,
    pub chat: ChatConfig,
}
