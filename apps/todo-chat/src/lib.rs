//! Todo store and per-room chat relay.
//!
//! Clients connect to `/ws/chat/{room_id}`. Every message they send is stored
//! under `chat:{room_id}:{timestamp}` and the room's recent window is pushed
//! to every member. A background sweeper drops history past the retention
//! horizon.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod retention;
pub mod rooms;
pub mod service;
pub mod storage;
pub mod websocket;

pub use config::{ChatConfig, ServerConfig};
pub use error::{ChatError, StoreError};
pub use handlers::{build_router, AppState};
pub use service::ChatService;
pub use storage::{InMemoryStore, KeyValueStore, RedisStore, SharedStore};
