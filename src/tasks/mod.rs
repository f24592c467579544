pub mod heartbeat;
pub mod sweep;
