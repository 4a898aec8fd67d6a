//! Wire-shape projection: domain rows to the JSON the clients render.

use chrono::{DateTime, Utc};

use backchannel_core::ids::UserId;
use backchannel_core::timefmt::format_relative_time;
use backchannel_core::User;
use backchannel_store::conversations::Conversation;
use backchannel_store::messages::{LastMessage, Message};
use backchannel_store::notifications::Notification;

/// Subtitle length cap for the conversation list.
const SUBTITLE_MAX_CHARS: usize = 30;

/// Display-only truncation; storage always keeps the full text.
pub fn truncate_subtitle(text: &str) -> String {
    if text.chars().count() <= SUBTITLE_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUBTITLE_MAX_CHARS).collect();
    out.push('…');
    out
}

/// Conversation list entry: stored fields plus the viewer-dependent title
/// and the last-message / unread projections.
pub fn conversation_summary(
    conversation: &Conversation,
    viewer_id: &UserId,
    last: Option<&LastMessage>,
    unread_count: i64,
) -> serde_json::Value {
    serde_json::json!({
        "id": conversation.id,
        "kind": conversation.kind,
        "title": conversation.display_title(viewer_id),
        "program_ref": conversation.program_ref,
        "created_at": conversation.created_at,
        "updated_at": conversation.updated_at,
        "participants": conversation.participants,
        "last_message": last.map(|l| serde_json::json!({
            "text": truncate_subtitle(&l.body),
            "time": l.created_at,
        })),
        "unread_count": unread_count,
    })
}

pub fn message_json(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "id": message.id,
        "conversation_id": message.conversation_id,
        "sender_id": message.sender_id,
        "kind": message.kind,
        "text": message.body,
        "file_ref": message.file_ref,
        "created_at": message.created_at,
        "read_by": message.read_by,
    })
}

pub fn notification_json(notification: &Notification, now: DateTime<Utc>) -> serde_json::Value {
    let time_ago = DateTime::parse_from_rfc3339(&notification.created_at)
        .map(|t| format_relative_time(t.with_timezone(&Utc), now))
        .unwrap_or_else(|_| notification.created_at.clone());

    serde_json::json!({
        "id": notification.id,
        "kind": notification.kind,
        "title": notification.title,
        "message": notification.body,
        "is_read": notification.is_read,
        "created_at": notification.created_at,
        "time_ago": time_ago,
    })
}

pub fn user_json(user: &User) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "role": user.role,
    })
}
