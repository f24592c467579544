pub mod auth;
pub mod offline;
pub mod rate_limit;
pub mod router;
pub mod webhook;
