//! 核心数据模型 / Core data model
//!
//! 连接、在线状态、房间、消息与离线信箱条目的共享定义。
//! Shared definitions for connections, presence, rooms, messages and offline mailbox entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::HubError;

pub type UserId = String;
pub type RoomId = String;
pub type ConnectionId = String;
pub type MessageId = u64;

/// 身份校验结果 / Result of identity verification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Identity {
    pub fn new<T: Into<String>>(user_id: T) -> Self {
        Self { user_id: user_id.into(), privileged: false, expires_at: None }
    }

    pub fn privileged<T: Into<String>>(user_id: T) -> Self {
        Self { user_id: user_id.into(), privileged: true, expires_at: None }
    }
}

/// 在线状态 / Presence status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(HubError::validation("status", format!("unknown status '{}'", other))),
        }
    }
}

/// 在线状态记录（集群共享）/ Presence record (cluster shared)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub status_at: i64,
    pub last_seen_at: i64,
    pub connection_count: u64,
}

impl PresenceRecord {
    pub fn offline<T: Into<String>>(user_id: T, now: i64) -> Self {
        Self {
            user_id: user_id.into(),
            status: PresenceStatus::Offline,
            status_at: now,
            last_seen_at: now,
            connection_count: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connection_count > 0
    }
}

/// 在线状态变更 / Presence state transition produced by one backend mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceTransition {
    pub previous: PresenceStatus,
    pub record: PresenceRecord,
    pub underflow: bool,
}

impl PresenceTransition {
    pub fn status_changed(&self) -> bool {
        self.previous != self.record.status
    }
}

/// 房间可见性 / Room visibility
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// 房间投递策略 / Room delivery policy
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// 离线成员不入信箱 / Offline members get no mailbox entry
    #[default]
    BestEffort,
    /// 离线成员各入一条信箱 / One mailbox entry per offline member
    Guaranteed,
}

/// 创建房间参数 / Room creation request
#[derive(Debug, Clone)]
pub struct RoomSpec {
    pub name: String,
    pub visibility: Visibility,
    pub owner_id: UserId,
    pub max_members: Option<usize>,
    pub delivery_policy: DeliveryPolicy,
}

/// 房间 / Room
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    pub name: String,
    pub visibility: Visibility,
    pub owner_id: UserId,
    pub member_ids: BTreeSet<UserId>,
    pub max_members: usize,
    pub delivery_policy: DeliveryPolicy,
    pub created_at: i64,
    pub last_active_at: i64,
}

impl Room {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.contains(user_id)
    }

    pub fn is_full(&self) -> bool {
        self.member_ids.len() >= self.max_members
    }
}

/// 房间成员变更结果 / Outcome of a membership insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Added,
    AlreadyMember,
    Full,
}

/// 消息类型 / Message type
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Private,
    Room,
    System,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Private => "private",
            MessageType::Room => "room",
            MessageType::System => "system",
            MessageType::File => "file",
        }
    }
}

/// 持久化消息 / Persisted message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender_id: Option<UserId>,
    pub target_id: Option<String>,
    pub room_id: Option<RoomId>,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub delivered: bool,
}

/// 离线信箱条目 / Offline mailbox entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEntry {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub enqueued_at: i64,
}

/// 当前毫秒时间戳 / Current unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
