// 领域模型与线上协议 / Domain model and wire protocol
pub mod message;
pub mod model;
