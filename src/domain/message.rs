use serde::{Deserialize, Serialize};

use super::model::{
    Message, MessageId, MessageType, PresenceRecord, PresenceStatus, Room, RoomId, UserId,
    Visibility,
};

/// 客户端上行帧 / Client → server frame
///
/// 线上格式 `{"type": "...", "data": {...}}`，与服务端下行帧一致。
/// Wire shape is `{"type": "...", "data": {...}}`, same as outbound frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    Authenticate {
        credential: String,
    },
    Message(InboundMessage),
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    StatusChange {
        status: PresenceStatus,
    },
    Pong {},
    CreateRoom {
        name: String,
        #[serde(default)]
        visibility: Visibility,
        #[serde(default)]
        max_members: Option<usize>,
        #[serde(default)]
        guaranteed_delivery: bool,
    },
    DeleteRoom {
        room_id: RoomId,
    },
    ListMembers {
        room_id: RoomId,
    },
    OnlineUsers {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
}

impl ClientFrame {
    /// 解析上行帧，空载荷帧可省略 `data` / Parse a client frame; empty frames may omit `data`
    ///
    /// `{"type":"pong"}` 与 `{"type":"pong","data":{}}` 等价。
    /// `{"type":"pong"}` is read the same as `{"type":"pong","data":{}}`.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(obj) = value.as_object_mut() {
            if !obj.contains_key("data") {
                obj.insert("data".to_string(), serde_json::Value::Object(Default::default()));
            }
        }
        serde_json::from_value(value)
    }
}

/// 客户端发送的消息体 / Message body sent by a client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub target_id: Option<UserId>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// 发送结果 / Send outcome reported back to the sender
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Queued,
    Broadcast,
}

/// 下行消息体 / Message body pushed to recipients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub room_id: Option<RoomId>,
    pub payload: serde_json::Value,
    pub created_at: i64,
    #[serde(default)]
    pub offline: bool,
}

impl MessageFrame {
    pub fn from_message(msg: &Message, offline: bool) -> Self {
        Self {
            message_id: msg.message_id,
            kind: msg.kind,
            sender_id: msg.sender_id.clone(),
            target_id: msg.target_id.clone(),
            room_id: msg.room_id.clone(),
            payload: msg.payload.clone(),
            created_at: msg.created_at,
            offline,
        }
    }
}

/// 服务端下行帧 / Server → client frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    ConnectionAck {
        user_id: UserId,
        connection_id: String,
    },
    Message(MessageFrame),
    MessageSent {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    UserStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    RoomCreated {
        room: Room,
    },
    RoomJoined {
        room_id: RoomId,
    },
    RoomLeft {
        room_id: RoomId,
    },
    MemberJoined {
        room_id: RoomId,
        user_id: UserId,
    },
    MemberLeft {
        room_id: RoomId,
        user_id: UserId,
    },
    RoomMembers {
        room_id: RoomId,
        members: Vec<UserId>,
    },
    OnlineUsers {
        users: Vec<PresenceRecord>,
    },
    RoomClosed {
        room_id: RoomId,
    },
    Error {
        #[serde(rename = "type")]
        error_type: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        retry_after_ms: Option<u64>,
    },
    Ping {
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 写入连接发送队列的条目 / Item queued on a connection's outbound channel
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close(String),
}
