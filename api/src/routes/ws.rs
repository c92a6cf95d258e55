use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::realtime::Hub;
use crate::realtime::event::{ClientCommand, ServerEvent};
use crate::realtime::registry::DeliveryStatus;
use crate::types::{MessageId, UserId};

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(connect))
}

async fn connect(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(state, auth.user_id, socket))
}

/// One live connection. Everything sent to the client goes through the
/// connection's registry queue, drained by a single writer task.
#[tracing::instrument(skip(state, socket))]
async fn session(state: AppState, user_id: UserId, socket: WebSocket) {
    let hub = state.hub;
    let registration = hub.connect(&user_id);
    let connection_id = registration.id.clone();
    let mut events = registration.events;
    tracing::info!(connection_id = %connection_id, "connection opened");

    // 登録後に同期イベントを積むので、切断中の取りこぼしは発生しない
    match hub.sync_events(&user_id).await {
        Ok(sync) => {
            for event in sync {
                hub.registry().deliver(&connection_id, event);
            }
        }
        Err(e) => tracing::warn!("failed to load sync events: {e}"),
    }

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(event = event.kind(), "failed to encode event: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader_hub = hub.clone();
    let reader_user = user_id.clone();
    let reader_connection = connection_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let reply = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(command) => handle_command(&reader_hub, &reader_user, command).await,
                Err(e) => Some(ServerEvent::Error {
                    message: format!("invalid command: {e}"),
                }),
            };
            if let Some(reply) = reply
                && reader_hub.registry().deliver(&reader_connection, reply)
                    == DeliveryStatus::Failed
            {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.disconnect(&connection_id);
    tracing::info!(connection_id = %connection_id, "connection closed");
}

/// Runs one client command. Returns the reply for the issuing connection, if any.
async fn handle_command(
    hub: &Hub,
    user_id: &UserId,
    command: ClientCommand,
) -> Option<ServerEvent> {
    let result = match command {
        ClientCommand::Send {
            chat_id,
            text,
            idempotency_key,
        } => hub
            .submit(&chat_id, user_id, &text, &idempotency_key)
            .await
            .map(|s| {
                Some(ServerEvent::MessageAck {
                    idempotency_key,
                    message_id: MessageId(s.message.id),
                    duplicate: !s.created,
                })
            }),
        ClientCommand::Read { message_ids } => Ok(Some(ServerEvent::ReadAck {
            results: hub.mark_read(user_id, &message_ids).await,
        })),
        ClientCommand::DraftUpdate { chat_id, text } => hub
            .update_draft(&chat_id, user_id, &text)
            .await
            .map(|_| None),
        ClientCommand::DraftDelete { chat_id } => {
            hub.delete_draft(&chat_id, user_id).await.map(|_| None)
        }
    };
    result.unwrap_or_else(|e| {
        Some(ServerEvent::Error {
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::types::ChatId;

    fn send(chat: &ChatId, key: &str) -> ClientCommand {
        ClientCommand::Send {
            chat_id: chat.clone(),
            text: "hello".into(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn send_is_acknowledged_and_retry_flagged_duplicate() {
        let pool = test_support::pool().await;
        let hub = test_support::hub(&pool);
        let chat = test_support::private(&pool, "alice", "bob").await;
        let alice = UserId::from("alice");

        let first = handle_command(&hub, &alice, send(&chat, "k")).await;
        let retry = handle_command(&hub, &alice, send(&chat, "k")).await;

        let ack = |reply: Option<ServerEvent>| match reply {
            Some(ServerEvent::MessageAck {
                message_id,
                duplicate,
                ..
            }) => (message_id, duplicate),
            other => panic!("expected ack, got {other:?}"),
        };
        let (a, a_dup) = ack(first);
        let (b, b_dup) = ack(retry);
        assert_eq!(a, b);
        assert!(!a_dup);
        assert!(b_dup);
    }

    #[tokio::test]
    async fn failures_become_error_replies() {
        let pool = test_support::pool().await;
        let hub = test_support::hub(&pool);
        let chat = test_support::private(&pool, "alice", "bob").await;

        let reply = handle_command(&hub, &UserId::from("eve"), send(&chat, "k")).await;
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));

        let reply = handle_command(
            &hub,
            &UserId::from("eve"),
            ClientCommand::DraftDelete { chat_id: chat },
        )
        .await;
        assert!(matches!(reply, Some(ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn drafts_have_no_reply_and_reads_are_acked() {
        let pool = test_support::pool().await;
        let hub = test_support::hub(&pool);
        let chat = test_support::private(&pool, "alice", "bob").await;
        let bob = UserId::from("bob");

        let reply = handle_command(
            &hub,
            &bob,
            ClientCommand::DraftUpdate {
                chat_id: chat.clone(),
                text: "typing".into(),
            },
        )
        .await;
        assert_eq!(reply, None);

        let reply = handle_command(
            &hub,
            &bob,
            ClientCommand::Read {
                message_ids: vec![MessageId::from("missing")],
            },
        )
        .await;
        let Some(ServerEvent::ReadAck { results }) = reply else {
            panic!("expected read ack");
        };
        assert!(!results[0].accepted);
    }
}
