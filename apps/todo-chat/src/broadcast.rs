use axum::extract::ws::Message;
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::error::ChatError;
use crate::messages::{parse_client_payload, ServerMessage};
use crate::retention::RetentionPolicy;
use crate::rooms::{PushOutcome, RoomRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub window: usize,
}

/// Persists incoming messages and pushes the room's recent window to every
/// member, the sender included.
///
/// Each call fetches the window and pushes it independently. Two senders in
/// the same room can therefore interleave, and a member may see a newer window
/// followed by a slightly older one; the next broadcast converges again.
#[derive(Clone)]
pub struct Broadcaster {
    registry: RoomRegistry,
    retention: RetentionPolicy,
}

impl Broadcaster {
    pub fn new(registry: RoomRegistry, retention: RetentionPolicy) -> Self {
        Self {
            registry,
            retention,
        }
    }

    /// Handle one raw client frame for `room_id`.
    ///
    /// Parse and store failures are returned to the caller before anything is
    /// pushed. A member whose queue is closed does not stop the fan-out; it is
    /// removed from the room once every other member has been served.
    pub async fn handle_incoming(
        &self,
        room_id: &str,
        raw: &str,
    ) -> Result<BroadcastReport, ChatError> {
        let fields = parse_client_payload(raw)?;
        self.retention.record(room_id, fields).await?;
        let messages = self.retention.recent(room_id).await?;
        let window = messages.len();
        let frame = serde_json::to_string(&ServerMessage::Messages { messages })?;

        let members = self.registry.members(room_id);
        let mut report = BroadcastReport {
            recipients: members.len(),
            window,
            ..BroadcastReport::default()
        };

        let mut failed = Vec::new();
        for member in &members {
            match member.push(Message::Text(frame.clone())) {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Dropped => {
                    report.dropped += 1;
                    counter!("todo_chat_frames_dropped_total").increment(1);
                    debug!(
                        room_id = %room_id,
                        connection_id = %member.id(),
                        "outbound queue full; frame dropped"
                    );
                }
                PushOutcome::Closed => failed.push(member.id()),
            }
        }

        for connection_id in failed {
            let remaining = self.registry.leave(room_id, connection_id);
            report.evicted += 1;
            info!(
                room_id = %room_id,
                connection_id = %connection_id,
                remaining,
                "evicted member after failed push"
            );
        }

        counter!("todo_chat_broadcasts_total").increment(1);
        counter!("todo_chat_frames_delivered_total").increment(report.delivered as u64);
        if report.evicted > 0 {
            counter!("todo_chat_members_evicted_total").increment(report.evicted as u64);
        }
        histogram!("todo_chat_window_size").record(window as f64);

        Ok(report)
    }
}
