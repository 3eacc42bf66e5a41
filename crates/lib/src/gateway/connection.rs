//! Per-connection lifecycle: rate check, authentication, session bind,
//! receive loop, teardown.
//!
//! One task per connection. Inbound frames are processed strictly one at a
//! time: the upstream forward is awaited inline, and frames that arrive
//! mid-forward are buffered in order. The socket keeps being polled during
//! the forward so a peer disconnect, like server shutdown, drops the
//! in-flight upstream call instead of letting its retries run out against
//! a dead connection. Pushes from the per-user broadcast group are
//! multiplexed into the same loop.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::auth::AuthScheme;
use crate::broadcast::MessagePush;
use crate::gateway::protocol::{
    ErrorFrame, InboundFrame, MessageFrame, TokenRefreshFrame, UserInfoFrame, CLOSE_AUTH_ERROR,
    CLOSE_RATE_LIMITED,
};
use crate::gateway::server::{ConnectQuery, GatewayState};
use crate::store::ChatSession;
use crate::users::Identity;

/// Advisory threshold: a `token_refresh_required` frame is sent with each
/// inbound message once this much time has passed since verification.
const TOKEN_REFRESH_AFTER: std::time::Duration = std::time::Duration::from_secs(300);

/// Reply substituted when the upstream is unavailable after all retries.
const FALLBACK_REPLY: &str =
    "Sorry, I can't reach the assistant right now. Please try again in a moment.";

/// Live connection state, owned by its task and never shared.
struct Connection {
    id: String,
    identity: Identity,
    session: ChatSession,
    last_token_verified_at: Instant,
}

/// What one processed frame means for the connection.
enum FrameOutcome {
    Continue,
    Close { code: u16, reason: String },
    /// Server shutdown arrived mid-frame; close without an error frame.
    Shutdown,
    /// Peer went away mid-frame; nothing left to send.
    Disconnected,
}

/// Drive one WebSocket connection from accept to close.
pub(crate) async fn handle_socket(
    mut socket: WebSocket,
    state: GatewayState,
    source: String,
    query: ConnectQuery,
) {
    // Rate check before anything else; denial is terminal for the attempt.
    if !state.limiter.admit(&source).await {
        close_with_error(
            &mut socket,
            CLOSE_RATE_LIMITED,
            "Rate limit exceeded. Please try again later.",
        )
        .await;
        return;
    }

    // Authenticate from the connect params.
    let (token, auth_type) = match (query.token, query.auth_type) {
        (Some(t), Some(a)) if !t.is_empty() && !a.is_empty() => (t, a),
        _ => {
            close_with_error(
                &mut socket,
                CLOSE_AUTH_ERROR,
                "no token or auth_type provided",
            )
            .await;
            return;
        }
    };
    let scheme = match AuthScheme::parse(&auth_type) {
        Ok(s) => s,
        Err(e) => {
            close_with_error(&mut socket, CLOSE_AUTH_ERROR, e.to_string()).await;
            return;
        }
    };
    let identity = match state.verifier.verify(&token, scheme).await {
        Ok(identity) => identity,
        Err(e) => {
            log::warn!("{} authentication failed: {}", scheme.as_str(), e);
            close_with_error(
                &mut socket,
                CLOSE_AUTH_ERROR,
                format!("authentication failed: {}", e),
            )
            .await;
            return;
        }
    };

    // Bind: one active session per user, plus the user's broadcast group.
    let session = state.store.get_or_create_session(&identity.user_id).await;
    let mut pushes = state.events.subscribe(&identity.user_id).await;
    let mut shutdown = state.shutdown.subscribe();
    let conn = Connection {
        id: format!("conn-{}", uuid::Uuid::new_v4()),
        identity,
        session,
        last_token_verified_at: Instant::now(),
    };
    log::info!(
        "user {} connected ({}, session {})",
        conn.identity.username,
        conn.id,
        conn.session.id
    );

    let user_info = UserInfoFrame::new(conn.identity.username.clone());
    if send_json(&mut socket, &user_info).await.is_err() {
        log::debug!("{} dropped before user_info", conn.id);
        return;
    }

    // Active: receive loop. Frames read while a forward was in flight are
    // queued and drained in arrival order before the next select.
    let mut pending: VecDeque<String> = VecDeque::new();
    'conn: loop {
        while let Some(text) = pending.pop_front() {
            let outcome =
                handle_text_frame(&mut socket, &state, &conn, &mut shutdown, &mut pending, &text)
                    .await;
            match outcome {
                Ok(FrameOutcome::Continue) => {}
                Ok(FrameOutcome::Close { code, reason }) => {
                    close_with_error(&mut socket, code, reason).await;
                    break 'conn;
                }
                Ok(FrameOutcome::Shutdown) => {
                    close_for_shutdown(&mut socket).await;
                    break 'conn;
                }
                Ok(FrameOutcome::Disconnected) => break 'conn,
                Err(e) => {
                    // Internal faults never crash the task; best-effort
                    // error frame, then close.
                    log::error!("{} internal fault: {:#}", conn.id, e);
                    close_with_error(
                        &mut socket,
                        CLOSE_AUTH_ERROR,
                        format!("message processing error: {}", e),
                    )
                    .await;
                    break 'conn;
                }
            }
        }
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                close_for_shutdown(&mut socket).await;
                break;
            }
            push = pushes.recv() => {
                match push {
                    Ok(push) => {
                        if let Some(frame) = push_frame(&push, &conn.id) {
                            if send_json(&mut socket, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("{} lagged {} pushes", conn.id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        pushes = state.events.subscribe(&conn.identity.user_id).await;
                    }
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => pending.push_back(text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Closed: dropping the push receiver deregisters from the broadcast
    // group; all remaining state is task-local.
    log::info!("user {} disconnected ({})", conn.identity.username, conn.id);
}

/// Process one inbound text frame. `Err` is an internal fault; `Close` is a
/// protocol violation. Text frames read while the forward is in flight land
/// in `pending` for the caller to drain.
async fn handle_text_frame(
    socket: &mut WebSocket,
    state: &GatewayState,
    conn: &Connection,
    shutdown: &mut broadcast::Receiver<()>,
    pending: &mut VecDeque<String>,
    text: &str,
) -> anyhow::Result<FrameOutcome> {
    // Non-fatal advisory when the token is stale; processing continues.
    if conn.last_token_verified_at.elapsed() > TOKEN_REFRESH_AFTER {
        if send_json(socket, &TokenRefreshFrame::new()).await.is_err() {
            log::debug!("{} could not send token refresh advisory", conn.id);
        }
    }

    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            return Ok(FrameOutcome::Close {
                code: CLOSE_AUTH_ERROR,
                reason: "invalid JSON format".to_string(),
            })
        }
    };
    let content = frame.content.unwrap_or_default();
    if frame.typ != "message" || content.is_empty() {
        return Ok(FrameOutcome::Close {
            code: CLOSE_AUTH_ERROR,
            reason: "invalid message format".to_string(),
        });
    }

    state
        .store
        .append_message(&conn.session.id, &content, true, Some(&conn.id))
        .await?;

    // The forward is raced against shutdown and the socket itself: a
    // draining server or a vanished peer drops the future, which cancels
    // the retry loop's sleeps. No reply is appended for a dead connection.
    let forward = state.upstream.forward(&content, &conn.session.id);
    tokio::pin!(forward);
    let reply = loop {
        tokio::select! {
            res = &mut forward => break match res {
                Ok(reply) => reply,
                Err(e) => {
                    log::error!("{} upstream forward failed: {}", conn.id, e);
                    FALLBACK_REPLY.to_string()
                }
            },
            _ = shutdown.recv() => return Ok(FrameOutcome::Shutdown),
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => pending.push_back(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Ok(FrameOutcome::Disconnected);
                }
                Some(Ok(_)) => {}
            },
        }
    };

    state
        .store
        .append_message(&conn.session.id, &reply, false, Some(&conn.id))
        .await?;

    let out = MessageFrame::new(uuid::Uuid::new_v4().to_string(), reply, false);
    if send_json(socket, &out).await.is_err() {
        return Ok(FrameOutcome::Disconnected);
    }
    Ok(FrameOutcome::Continue)
}

/// Frame for a broadcast push, or None when it should be dropped: echoes of
/// this connection's own writes, and empty or whitespace-only content from
/// external writers.
fn push_frame(push: &MessagePush, conn_id: &str) -> Option<MessageFrame> {
    if push.origin.as_deref() == Some(conn_id) {
        return None;
    }
    if push.content.trim().is_empty() {
        log::debug!("skipping empty broadcast push");
        return None;
    }
    Some(MessageFrame::new(
        push.message_id.clone(),
        push.content.clone(),
        push.from_user,
    ))
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, frame: &T) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

/// Plain close for graceful shutdown; no error frame.
async fn close_for_shutdown(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::AWAY,
            reason: "server shutting down".into(),
        })))
        .await;
}

/// Send an error frame, then close with the code. Safe to call at any
/// point; failures on an already-dead socket are ignored.
async fn close_with_error(socket: &mut WebSocket, code: u16, reason: impl Into<String>) {
    let reason = reason.into();
    let _ = send_json(socket, &ErrorFrame::new(code, reason.clone())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(content: &str, origin: Option<&str>) -> MessagePush {
        MessagePush {
            message_id: "m1".to_string(),
            content: content.to_string(),
            from_user: false,
            created_at: chrono::Utc::now(),
            origin: origin.map(|s| s.to_string()),
        }
    }

    #[test]
    fn own_origin_pushes_are_skipped() {
        assert!(push_frame(&push("hello", Some("conn-1")), "conn-1").is_none());
        assert!(push_frame(&push("hello", Some("conn-2")), "conn-1").is_some());
        assert!(push_frame(&push("hello", None), "conn-1").is_some());
    }

    #[test]
    fn blank_pushes_are_dropped() {
        assert!(push_frame(&push("", None), "conn-1").is_none());
        assert!(push_frame(&push("  \n\t", None), "conn-1").is_none());
    }

    #[test]
    fn relayed_push_keeps_id_and_direction() {
        let frame = push_frame(&push("external", None), "conn-1").unwrap();
        assert_eq!(frame.id, "m1");
        assert_eq!(frame.content, "external");
        assert!(!frame.is_user);
    }
}
