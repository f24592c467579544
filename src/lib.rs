//! v-connect-hub: 实时连接、在线状态与房间枢纽 / real-time connection, presence and room hub

pub mod cluster;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod presence;
pub mod room;
pub mod server;
pub mod service;
pub mod storage;
pub mod tasks;
pub mod ws;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use logging::init_tracing;
pub use server::lifecycle::DisconnectReason;
pub use server::{ImHub, Stores};
