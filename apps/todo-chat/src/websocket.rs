//! Per-connection lifecycle for `/ws/chat/{room_id}`.

use std::fmt::Display;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::messages::ServerMessage;
use crate::rooms::{ConnectionHandle, ConnectionId};
use crate::service::ChatService;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Joined,
    Disconnected,
}

/// WebSocket upgrade handler
pub async fn chat_socket_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let chat = state.chat.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, chat))
}

async fn handle_socket(socket: WebSocket, room_id: String, chat: ChatService) {
    let (sender, receiver) = socket.split();
    run_connection(sender, receiver, room_id, chat).await;
}

struct Connection {
    id: ConnectionId,
    room_id: String,
    state: ConnectionState,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        debug!(
            room_id = %self.room_id,
            connection_id = %self.id,
            from = ?self.state,
            to = ?next,
            "connection state change"
        );
        self.state = next;
    }
}

/// Drive one client from join to disconnect.
///
/// Outbound frames go through a bounded queue drained by a writer task; the
/// queue's sender is what the room registry holds. The member leaves its room
/// on every exit path: a close frame, a transport error, the end of the
/// stream, or this future being dropped mid-flight.
pub async fn run_connection<Si, St, E>(
    sink: Si,
    mut stream: St,
    room_id: String,
    chat: ChatService,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut conn = Connection {
        id: ConnectionId::new(),
        room_id,
        state: ConnectionState::Connecting,
    };

    let (tx, rx) = mpsc::channel::<Message>(chat.outbound_buffer());
    let handle = ConnectionHandle::new(conn.id, tx);
    let writer = tokio::spawn(write_frames(sink, rx));
    let (mut membership, members) = RoomMembership::join(&chat, &conn, handle.clone(), writer);
    conn.transition(ConnectionState::Joined);
    counter!("todo_chat_connections_total").increment(1);
    info!(
        room_id = %conn.room_id,
        connection_id = %conn.id,
        members,
        "chat connection joined"
    );

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    room_id = %conn.room_id,
                    connection_id = %conn.id,
                    error = %err,
                    "error receiving frame"
                );
                break;
            }
        };

        match frame {
            Message::Text(text) => on_text(&conn, &chat, &handle, &text).await,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => on_text(&conn, &chat, &handle, &text).await,
                Err(_) => reply_error(&handle, "binary frames must contain UTF-8 JSON"),
            },
            Message::Close(_) => {
                debug!(
                    room_id = %conn.room_id,
                    connection_id = %conn.id,
                    "client sent close frame"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    conn.transition(ConnectionState::Disconnected);
    let remaining = membership.leave();
    drop(handle);
    membership.drain_writer().await;

    info!(
        room_id = %conn.room_id,
        connection_id = %conn.id,
        remaining,
        "chat connection closed"
    );
}

/// A connection's seat in its room plus the writer task feeding its socket.
/// Dropping it leaves the room and stops the writer.
struct RoomMembership {
    chat: ChatService,
    room_id: String,
    id: ConnectionId,
    writer: JoinHandle<()>,
    left: bool,
}

impl RoomMembership {
    fn join(
        chat: &ChatService,
        conn: &Connection,
        handle: ConnectionHandle,
        writer: JoinHandle<()>,
    ) -> (Self, usize) {
        let members = chat.registry().join(&conn.room_id, handle);
        gauge!("todo_chat_rooms_active").set(chat.registry().room_count() as f64);
        let membership = Self {
            chat: chat.clone(),
            room_id: conn.room_id.clone(),
            id: conn.id,
            writer,
            left: false,
        };
        (membership, members)
    }

    /// Remove the member from its room. Returns the remaining member count.
    fn leave(&mut self) -> usize {
        if self.left {
            return self.chat.registry().member_count(&self.room_id);
        }
        self.left = true;
        let remaining = self.chat.registry().leave(&self.room_id, self.id);
        gauge!("todo_chat_rooms_active").set(self.chat.registry().room_count() as f64);
        counter!("todo_chat_connections_closed_total").increment(1);
        remaining
    }

    /// Give the writer up to the drain timeout to flush frames already queued.
    async fn drain_writer(&mut self) {
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            debug!(
                room_id = %self.room_id,
                connection_id = %self.id,
                "writer did not drain in time"
            );
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        if !self.left {
            let remaining = self.leave();
            warn!(
                room_id = %self.room_id,
                connection_id = %self.id,
                remaining,
                "connection task ended abnormally; member removed"
            );
        }
        self.writer.abort();
    }
}

async fn write_frames<Si>(mut sink: Si, mut rx: mpsc::Receiver<Message>)
where
    Si: Sink<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
}

async fn on_text(conn: &Connection, chat: &ChatService, handle: &ConnectionHandle, text: &str) {
    match chat.broadcaster().handle_incoming(&conn.room_id, text).await {
        Ok(report) => debug!(
            room_id = %conn.room_id,
            connection_id = %conn.id,
            delivered = report.delivered,
            evicted = report.evicted,
            window = report.window,
            "broadcast complete"
        ),
        Err(err) => {
            counter!("todo_chat_message_errors_total", "reason" => err.metric_label()).increment(1);
            warn!(
                room_id = %conn.room_id,
                connection_id = %conn.id,
                error = %err,
                "failed to handle chat message"
            );
            reply_error(handle, &err.client_message());
        }
    }
}

fn reply_error(handle: &ConnectionHandle, message: &str) {
    let frame = ServerMessage::Error {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = handle.push(Message::Text(json));
    }
}
