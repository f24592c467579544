//! 存储协作方接口 / Storage collaborator contracts
//!
//! 消息、房间、离线信箱与在线状态均通过这些 trait 访问，
//! 默认实现为内存版 [`memory::MemoryStore`]，可替换为任意共享后端。
//! Messages, rooms, the offline mailbox and presence are reached only through these traits.
//! The default implementation is the in-memory [`memory::MemoryStore`]; any shared backend can
//! be plugged in.

pub mod memory;
pub mod retry;

use async_trait::async_trait;

use crate::domain::model::{
    MembershipChange, Message, MessageId, OfflineEntry, PresenceRecord, PresenceStatus,
    PresenceTransition, Room, UserId,
};
use crate::error::HubResult;

/// 消息存储 / Message persistence
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 分配单调递增的消息ID / Allocate the next monotonic message id
    async fn next_message_id(&self) -> HubResult<MessageId>;
    async fn persist_message(&self, msg: &Message) -> HubResult<()>;
    async fn mark_delivered(&self, message_id: MessageId) -> HubResult<()>;
    async fn get_message(&self, message_id: MessageId) -> HubResult<Option<Message>>;
}

/// 房间与成员存储（集群共享）/ Room and membership store (cluster shared)
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// 名称唯一，重复时返回 DuplicateName / Names are unique; duplicates yield DuplicateName
    async fn create_room(&self, room: &Room) -> HubResult<()>;
    async fn get_room(&self, room_id: &str) -> HubResult<Option<Room>>;
    async fn delete_room(&self, room_id: &str) -> HubResult<Option<Room>>;
    /// 原子地检查容量并加入 / Atomically check capacity and insert
    async fn add_member(&self, room_id: &str, user_id: &str) -> HubResult<MembershipChange>;
    async fn remove_member(&self, room_id: &str, user_id: &str) -> HubResult<bool>;
    async fn list_members(&self, room_id: &str) -> HubResult<Vec<UserId>>;
    async fn list_rooms(&self) -> HubResult<Vec<Room>>;
    async fn touch_room(&self, room_id: &str, at: i64) -> HubResult<()>;
}

/// 离线信箱存储 / Offline mailbox store
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn enqueue(&self, entry: &OfflineEntry) -> HubResult<()>;
    /// 按 enqueued_at、message_id 升序 / Ordered by enqueued_at then message_id
    async fn list_entries(&self, user_id: &str, limit: usize) -> HubResult<Vec<OfflineEntry>>;
    async fn remove_entry(&self, user_id: &str, message_id: MessageId) -> HubResult<bool>;
    async fn count(&self, user_id: &str) -> HubResult<usize>;
    /// 删除最旧的 n 条 / Drop the n oldest entries
    async fn evict_oldest(&self, user_id: &str, n: usize) -> HubResult<usize>;
    /// 删除早于 before 的条目 / Drop entries enqueued before `before`
    async fn purge_expired(&self, before: i64) -> HubResult<usize>;
}

/// 在线状态后端（集群共享，原子计数）/ Presence backend (cluster shared, atomic counters)
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn increment(&self, user_id: &str, at: i64) -> HubResult<PresenceTransition>;
    /// 计数在零处截断，下溢时 `underflow = true` / Clamped at zero; reports underflow
    async fn decrement(&self, user_id: &str, at: i64) -> HubResult<PresenceTransition>;
    /// 最后写入者胜 / Last writer wins by `at`
    async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        at: i64,
    ) -> HubResult<PresenceTransition>;
    async fn get(&self, user_id: &str) -> HubResult<Option<PresenceRecord>>;
    async fn list_online(&self) -> HubResult<Vec<PresenceRecord>>;
}
