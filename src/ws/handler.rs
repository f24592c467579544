use tracing::debug;

use crate::domain::message::{ClientFrame, ServerFrame};
use crate::domain::model::{DeliveryPolicy, RoomSpec};
use crate::error::{HubError, HubResult};
use crate::server::{Connection, ImHub};

/// 处理一条文本帧，错误以 error 帧回给发送者 / Handle one text frame; errors go back as error frames
pub async fn handle_text(hub: &ImHub, connection_id: &str, text: &str) {
    let conn = match hub.registry.get(connection_id) {
        Some(c) => c,
        None => return,
    };
    // 任何入站帧都视为存活 / Any inbound frame counts as liveness
    hub.heartbeat(connection_id);
    debug!("📨 Received text from {}: {}", connection_id, text);
    let result = match ClientFrame::parse(text) {
        Ok(frame) => dispatch_frame(hub, &conn, frame).await,
        Err(e) => Err(HubError::validation("frame", format!("invalid frame: {}", e))),
    };
    if let Err(e) = result {
        let _ = conn.send(e.to_frame());
    }
}

/// 按帧类型分发 / Dispatch by frame type
pub async fn dispatch_frame(hub: &ImHub, conn: &Connection, frame: ClientFrame) -> HubResult<()> {
    match frame {
        ClientFrame::Authenticate { .. } => Err(HubError::validation("type", "connection is already authenticated")),
        ClientFrame::Pong {} => {
            debug!("🏓 Pong from {}", conn.connection_id);
            Ok(())
        }
        ClientFrame::Message(inbound) => hub.router.route(conn, inbound).await.map(|_| ()),
        ClientFrame::JoinRoom { room_id } => {
            hub.rooms.join_room(&conn.connection_id, &room_id).await?;
            conn.send(ServerFrame::RoomJoined { room_id })
        }
        ClientFrame::LeaveRoom { room_id } => {
            hub.rooms.leave_room(&conn.connection_id, &room_id).await?;
            conn.send(ServerFrame::RoomLeft { room_id })
        }
        ClientFrame::StatusChange { status } => hub.presence.set_status(conn.user_id(), status).await.map(|_| ()),
        ClientFrame::CreateRoom { name, visibility, max_members, guaranteed_delivery } => {
            let room = hub
                .rooms
                .create_room(RoomSpec {
                    name,
                    visibility,
                    owner_id: conn.user_id().to_string(),
                    max_members,
                    delivery_policy: if guaranteed_delivery {
                        DeliveryPolicy::Guaranteed
                    } else {
                        DeliveryPolicy::BestEffort
                    },
                })
                .await?;
            hub.registry.associate_room(&conn.connection_id, &room.room_id);
            conn.send(ServerFrame::RoomCreated { room })
        }
        ClientFrame::DeleteRoom { room_id } => hub.rooms.delete_room(&room_id, &conn.identity).await.map(|_| ()),
        ClientFrame::ListMembers { room_id } => {
            let members = hub.rooms.list_members(&room_id).await?;
            conn.send(ServerFrame::RoomMembers { room_id, members })
        }
        ClientFrame::OnlineUsers { room_id } => {
            let users = hub.presence.get_online_users(room_id.as_deref()).await?;
            conn.send(ServerFrame::OnlineUsers { users })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::PresenceStatus;
    use crate::server::testing::{connect, frames, test_hub, TestHub};

    #[tokio::test]
    async fn invalid_json_yields_validation_error() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (c, mut rx) = connect(&hub, "a").await;
        frames(&mut rx);
        handle_text(&hub, &c.connection_id, "{not json").await;
        match frames(&mut rx).as_slice() {
            [ServerFrame::Error { error_type, .. }] => assert_eq!(error_type, "validation_error"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn room_flow_over_frames() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (a, mut a_rx) = connect(&hub, "a").await;
        let (b, mut b_rx) = connect(&hub, "b").await;
        handle_text(&hub, &a.connection_id, r#"{"type":"create_room","data":{"name":"lobby"}}"#).await;
        let room_id = frames(&mut a_rx)
            .into_iter()
            .find_map(|f| match f {
                ServerFrame::RoomCreated { room } => Some(room.room_id),
                _ => None,
            })
            .unwrap();

        let join = format!(r#"{{"type":"join_room","data":{{"roomId":"{}"}}}}"#, room_id);
        handle_text(&hub, &b.connection_id, &join).await;
        assert!(frames(&mut b_rx).contains(&ServerFrame::RoomJoined { room_id: room_id.clone() }));

        let list = format!(r#"{{"type":"list_members","data":{{"roomId":"{}"}}}}"#, room_id);
        handle_text(&hub, &b.connection_id, &list).await;
        assert!(frames(&mut b_rx).contains(&ServerFrame::RoomMembers {
            room_id: room_id.clone(),
            members: vec!["a".into(), "b".into()]
        }));

        let del = format!(r#"{{"type":"delete_room","data":{{"roomId":"{}"}}}}"#, room_id);
        handle_text(&hub, &b.connection_id, &del).await;
        assert!(frames(&mut b_rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::Error { error_type, .. } if error_type == "permission_denied")));
    }

    #[tokio::test]
    async fn status_change_and_online_users() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (a, mut a_rx) = connect(&hub, "a").await;
        handle_text(&hub, &a.connection_id, r#"{"type":"status_change","data":{"status":"busy"}}"#).await;
        handle_text(&hub, &a.connection_id, r#"{"type":"online_users","data":{}}"#).await;
        let got = frames(&mut a_rx);
        assert!(got.contains(&ServerFrame::UserStatusChanged { user_id: "a".into(), status: PresenceStatus::Busy }));
        let users = got
            .iter()
            .find_map(|f| match f {
                ServerFrame::OnlineUsers { users } => Some(users.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].status, PresenceStatus::Busy);

        handle_text(&hub, &a.connection_id, r#"{"type":"status_change","data":{"status":"offline"}}"#).await;
        assert!(frames(&mut a_rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::Error { error_type, .. } if error_type == "validation_error")));
    }

    #[tokio::test]
    async fn bare_pong_is_accepted_silently() {
        let TestHub { hub, .. } = test_hub(|_| {});
        let (a, mut a_rx) = connect(&hub, "a").await;
        frames(&mut a_rx);
        handle_text(&hub, &a.connection_id, r#"{"type":"pong"}"#).await;
        assert!(frames(&mut a_rx).is_empty());
        handle_text(&hub, &a.connection_id, r#"{"type":"online_users"}"#).await;
        assert!(matches!(frames(&mut a_rx).as_slice(), [ServerFrame::OnlineUsers { .. }]));
    }
}
