use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::{MessageStore, OfflineStore, PresenceBackend, RoomStore};
use crate::domain::model::{
    MembershipChange, Message, MessageId, OfflineEntry, PresenceRecord, PresenceStatus,
    PresenceTransition, Room, UserId,
};
use crate::error::{HubError, HubResult};

/// 内存版共享存储 / In-memory shared store
///
/// 多个 `ImHub` 共享同一个 `Arc<MemoryStore>` 即可模拟多进程集群共享的后端。
/// Several hubs holding the same `Arc<MemoryStore>` behave like processes sharing one backend.
pub struct MemoryStore {
    messages: DashMap<MessageId, Message>,
    message_seq: AtomicU64,
    rooms: DashMap<String, Room>,
    room_names: DashMap<String, String>,
    mailboxes: DashMap<UserId, Vec<OfflineEntry>>,
    presence: DashMap<UserId, PresenceRecord>,
    available: AtomicBool,
    fail_next: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            message_seq: AtomicU64::new(0),
            rooms: DashMap::new(),
            room_names: DashMap::new(),
            mailboxes: DashMap::new(),
            presence: DashMap::new(),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
        }
    }

    /// 模拟后端不可达 / Simulate the backend going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 接下来 n 次调用失败 / Fail the next n calls, then recover
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> HubResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HubError::store_unavailable(store, "backend offline"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(HubError::store_unavailable(store, "transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn next_message_id(&self) -> HubResult<MessageId> {
        self.check("messages")?;
        Ok(self.message_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn persist_message(&self, msg: &Message) -> HubResult<()> {
        self.check("messages")?;
        self.messages.insert(msg.message_id, msg.clone());
        Ok(())
    }

    async fn mark_delivered(&self, message_id: MessageId) -> HubResult<()> {
        self.check("messages")?;
        if let Some(mut m) = self.messages.get_mut(&message_id) {
            m.delivered = true;
        }
        Ok(())
    }

    async fn get_message(&self, message_id: MessageId) -> HubResult<Option<Message>> {
        self.check("messages")?;
        Ok(self.messages.get(&message_id).map(|m| m.clone()))
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(&self, room: &Room) -> HubResult<()> {
        self.check("rooms")?;
        match self.room_names.entry(room.name.to_lowercase()) {
            Entry::Occupied(_) => Err(HubError::DuplicateName { name: room.name.clone() }),
            Entry::Vacant(slot) => {
                slot.insert(room.room_id.clone());
                self.rooms.insert(room.room_id.clone(), room.clone());
                Ok(())
            }
        }
    }

    async fn get_room(&self, room_id: &str) -> HubResult<Option<Room>> {
        self.check("rooms")?;
        Ok(self.rooms.get(room_id).map(|r| r.clone()))
    }

    async fn delete_room(&self, room_id: &str) -> HubResult<Option<Room>> {
        self.check("rooms")?;
        let removed = self.rooms.remove(room_id).map(|(_, r)| r);
        if let Some(room) = &removed {
            self.room_names.remove(&room.name.to_lowercase());
        }
        Ok(removed)
    }

    async fn add_member(&self, room_id: &str, user_id: &str) -> HubResult<MembershipChange> {
        self.check("rooms")?;
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| HubError::room_not_found(room_id))?;
        if room.is_member(user_id) {
            return Ok(MembershipChange::AlreadyMember);
        }
        if room.is_full() {
            return Ok(MembershipChange::Full);
        }
        room.member_ids.insert(user_id.to_string());
        Ok(MembershipChange::Added)
    }

    async fn remove_member(&self, room_id: &str, user_id: &str) -> HubResult<bool> {
        self.check("rooms")?;
        match self.rooms.get_mut(room_id) {
            Some(mut room) => Ok(room.member_ids.remove(user_id)),
            None => Err(HubError::room_not_found(room_id)),
        }
    }

    async fn list_members(&self, room_id: &str) -> HubResult<Vec<UserId>> {
        self.check("rooms")?;
        self.rooms
            .get(room_id)
            .map(|r| r.member_ids.iter().cloned().collect())
            .ok_or_else(|| HubError::room_not_found(room_id))
    }

    async fn list_rooms(&self) -> HubResult<Vec<Room>> {
        self.check("rooms")?;
        Ok(self.rooms.iter().map(|r| r.value().clone()).collect())
    }

    async fn touch_room(&self, room_id: &str, at: i64) -> HubResult<()> {
        self.check("rooms")?;
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.last_active_at = room.last_active_at.max(at);
        }
        Ok(())
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn enqueue(&self, entry: &OfflineEntry) -> HubResult<()> {
        self.check("offline")?;
        let mut box_ = self.mailboxes.entry(entry.user_id.clone()).or_default();
        if box_.iter().any(|e| e.message_id == entry.message_id) {
            return Ok(());
        }
        box_.push(entry.clone());
        box_.sort_by_key(|e| (e.enqueued_at, e.message_id));
        Ok(())
    }

    async fn list_entries(&self, user_id: &str, limit: usize) -> HubResult<Vec<OfflineEntry>> {
        self.check("offline")?;
        Ok(self
            .mailboxes
            .get(user_id)
            .map(|b| b.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_entry(&self, user_id: &str, message_id: MessageId) -> HubResult<bool> {
        self.check("offline")?;
        let removed = match self.mailboxes.get_mut(user_id) {
            Some(mut b) => {
                let before = b.len();
                b.retain(|e| e.message_id != message_id);
                b.len() != before
            }
            None => false,
        };
        self.mailboxes.remove_if(user_id, |_, b| b.is_empty());
        Ok(removed)
    }

    async fn count(&self, user_id: &str) -> HubResult<usize> {
        self.check("offline")?;
        Ok(self.mailboxes.get(user_id).map(|b| b.len()).unwrap_or(0))
    }

    async fn evict_oldest(&self, user_id: &str, n: usize) -> HubResult<usize> {
        self.check("offline")?;
        let evicted = match self.mailboxes.get_mut(user_id) {
            Some(mut b) => {
                let k = n.min(b.len());
                b.drain(..k);
                k
            }
            None => 0,
        };
        Ok(evicted)
    }

    async fn purge_expired(&self, before: i64) -> HubResult<usize> {
        self.check("offline")?;
        let mut purged = 0usize;
        for mut b in self.mailboxes.iter_mut() {
            let len = b.len();
            b.retain(|e| e.enqueued_at >= before);
            purged += len - b.len();
        }
        self.mailboxes.retain(|_, b| !b.is_empty());
        Ok(purged)
    }
}

#[async_trait]
impl PresenceBackend for MemoryStore {
    async fn increment(&self, user_id: &str, at: i64) -> HubResult<PresenceTransition> {
        self.check("presence")?;
        let mut rec = self
            .presence
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::offline(user_id, at));
        let previous = rec.status;
        rec.connection_count += 1;
        if rec.status == PresenceStatus::Offline {
            rec.status = PresenceStatus::Online;
            rec.status_at = at;
        }
        rec.last_seen_at = at;
        Ok(PresenceTransition { previous, record: rec.clone(), underflow: false })
    }

    async fn decrement(&self, user_id: &str, at: i64) -> HubResult<PresenceTransition> {
        self.check("presence")?;
        let mut rec = self
            .presence
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::offline(user_id, at));
        let previous = rec.status;
        let underflow = rec.connection_count == 0;
        rec.connection_count = rec.connection_count.saturating_sub(1);
        if rec.connection_count == 0 {
            rec.status = PresenceStatus::Offline;
            rec.status_at = at;
        }
        rec.last_seen_at = at;
        Ok(PresenceTransition { previous, record: rec.clone(), underflow })
    }

    async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        at: i64,
    ) -> HubResult<PresenceTransition> {
        self.check("presence")?;
        let mut rec = self
            .presence
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord::offline(user_id, at));
        let previous = rec.status;
        if at >= rec.status_at {
            rec.status = status;
            rec.status_at = at;
        }
        Ok(PresenceTransition { previous, record: rec.clone(), underflow: false })
    }

    async fn get(&self, user_id: &str) -> HubResult<Option<PresenceRecord>> {
        self.check("presence")?;
        Ok(self.presence.get(user_id).map(|r| r.clone()))
    }

    async fn list_online(&self) -> HubResult<Vec<PresenceRecord>> {
        self.check("presence")?;
        Ok(self
            .presence
            .iter()
            .filter(|r| r.is_online())
            .map(|r| r.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{DeliveryPolicy, Visibility};
    use std::collections::BTreeSet;

    fn room(id: &str, name: &str, max: usize) -> Room {
        Room {
            room_id: id.into(),
            name: name.into(),
            visibility: Visibility::Public,
            owner_id: "owner".into(),
            member_ids: BTreeSet::from(["owner".to_string()]),
            max_members: max,
            delivery_policy: DeliveryPolicy::BestEffort,
            created_at: 0,
            last_active_at: 0,
        }
    }

    #[tokio::test]
    async fn room_names_are_unique_case_insensitively() {
        let store = MemoryStore::new();
        store.create_room(&room("r1", "Lobby", 10)).await.unwrap();
        let err = store.create_room(&room("r2", "lobby", 10)).await.unwrap_err();
        assert!(matches!(err, HubError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn add_member_respects_capacity() {
        let store = MemoryStore::new();
        store.create_room(&room("r1", "Small", 2)).await.unwrap();
        assert_eq!(store.add_member("r1", "u1").await.unwrap(), MembershipChange::Added);
        assert_eq!(store.add_member("r1", "u1").await.unwrap(), MembershipChange::AlreadyMember);
        assert_eq!(store.add_member("r1", "u2").await.unwrap(), MembershipChange::Full);
    }

    #[tokio::test]
    async fn mailbox_is_ordered_and_deduplicated() {
        let store = MemoryStore::new();
        for (id, at) in [(3u64, 30i64), (1, 10), (2, 20), (1, 10)] {
            store
                .enqueue(&OfflineEntry { user_id: "u".into(), message_id: id, enqueued_at: at })
                .await
                .unwrap();
        }
        let ids: Vec<_> = store.list_entries("u", 10).await.unwrap().iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.purge_expired(25).await.unwrap(), 2);
        assert_eq!(store.count("u").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn presence_counter_never_goes_negative() {
        let store = MemoryStore::new();
        let t = store.decrement("u", 1).await.unwrap();
        assert!(t.underflow);
        assert_eq!(t.record.connection_count, 0);
        let t = store.increment("u", 2).await.unwrap();
        assert_eq!(t.previous, PresenceStatus::Offline);
        assert_eq!(t.record.status, PresenceStatus::Online);
        assert_eq!(t.record.connection_count, 1);
    }

    #[tokio::test]
    async fn status_is_last_writer_wins() {
        let store = MemoryStore::new();
        store.increment("u", 1).await.unwrap();
        store.set_status("u", PresenceStatus::Busy, 10).await.unwrap();
        let t = store.set_status("u", PresenceStatus::Away, 5).await.unwrap();
        assert_eq!(t.record.status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn injected_failures_recover() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(store.next_message_id().await.is_err());
        assert_eq!(store.next_message_id().await.unwrap(), 1);
    }
}
