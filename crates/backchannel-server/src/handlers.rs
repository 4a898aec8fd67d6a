//! RPC method handlers organized by domain.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use backchannel_core::ids::{ConversationId, NotificationId, UserId};
use backchannel_core::Role;
use backchannel_policy::BootstrapEngine;
use backchannel_store::conversations::{ConversationKind, ConversationRepo};
use backchannel_store::messages::{FileRef, MessageKind, MessageRepo};
use backchannel_store::notifications::{NotificationKind, NotificationRepo};
use backchannel_store::users::UserRepo;
use backchannel_store::Database;

use crate::rpc::{self, RpcResponse};
use crate::view_state::ViewStates;
use crate::wire;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub views: ViewStates,
}

impl HandlerState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            views: ViewStates::new(),
        }
    }
}

/// Dispatch an RPC method to the appropriate handler.
pub fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Conversation directory
        "conversation.list" => conversation_list(state, params, id),
        "conversation.create" => conversation_create(state, params, id),
        "conversation.markRead" => conversation_mark_read(state, params, id),

        // Bootstrap policy engine
        "bootstrap.run" => bootstrap_run(state, params, id),

        // Message store
        "message.list" => message_list(state, params, id),
        "message.send" => message_send(state, params, id),

        // User directory
        "user.search" => user_search(state, params, id),

        // Notification center
        "notification.list" => notification_list(state, params, id),
        "notification.markRead" => notification_mark_read(state, params, id),
        "notification.markAllRead" => notification_mark_all_read(state, params, id),
        "notification.delete" => notification_delete(state, params, id),
        "notification.deleteAll" => notification_delete_all(state, params, id),
        "notification.toggleExpanded" => notification_toggle_expanded(state, params, id),

        // Session
        "session.end" => session_end(state, params, id),

        // System
        "system.ping" | "health" => health(id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn parse_role(params: &serde_json::Value, key: &str) -> Result<Role, String> {
    let raw = rpc::require_str(params, key)?;
    raw.parse::<Role>()
}

// ── Conversation handlers ──

fn conversation_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let role = match parse_role(params, "user_role") {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let conversations = ConversationRepo::new(state.db.clone());
    let messages = MessageRepo::new(state.db.clone());

    let listed = match conversations.list_for_user(&user_id, role) {
        Ok(listed) => listed,
        Err(e) => return RpcResponse::from_store_error(id, &e),
    };

    let mut summaries = Vec::with_capacity(listed.len());
    for conversation in &listed {
        let last = match messages.last_message(&conversation.id) {
            Ok(last) => last,
            Err(e) => return RpcResponse::from_store_error(id, &e),
        };
        let unread = match messages.unread_count(&conversation.id, &user_id) {
            Ok(unread) => unread,
            Err(e) => return RpcResponse::from_store_error(id, &e),
        };
        summaries.push(wire::conversation_summary(conversation, &user_id, last.as_ref(), unread));
    }

    RpcResponse::success(id, serde_json::json!({ "conversations": summaries }))
}

fn conversation_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let creator = match rpc::require_str(params, "created_by") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let participant_ids: Vec<UserId> = match rpc::require_str_list(params, "participant_ids") {
        Ok(ids) => ids.into_iter().map(UserId::from_raw).collect(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let requested_kind = match rpc::optional_str(params, "kind") {
        Some(raw) => match raw.parse::<ConversationKind>() {
            Ok(kind) => Some(kind),
            Err(e) => return RpcResponse::invalid_params(id, e),
        },
        None => None,
    };
    let program_ref = rpc::optional_str(params, "program_ref");

    let conversations = ConversationRepo::new(state.db.clone());
    let messages = MessageRepo::new(state.db.clone());

    let conversation =
        match conversations.create(&creator, title, &participant_ids, requested_kind, program_ref) {
            Ok(conversation) => conversation,
            Err(e) => return RpcResponse::from_store_error(id, &e),
        };

    // Direct creates are find-or-create, so the conversation may already
    // have history worth projecting.
    let last = messages.last_message(&conversation.id).ok().flatten();
    let unread = messages.unread_count(&conversation.id, &creator).unwrap_or(0);

    RpcResponse::success(
        id,
        serde_json::json!({
            "conversation": wire::conversation_summary(&conversation, &creator, last.as_ref(), unread),
        }),
    )
}

fn conversation_mark_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match rpc::require_str(params, "conversation_id") {
        Ok(s) => ConversationId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let messages = MessageRepo::new(state.db.clone());
    match messages.mark_conversation_read(&conversation_id, &user_id) {
        Ok(marked) => RpcResponse::success(
            id,
            serde_json::json!({ "marked": marked, "unread_count": 0 }),
        ),
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

// ── Bootstrap handler ──

fn bootstrap_run(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let users = UserRepo::new(state.db.clone());
    let caller = match users.get(&user_id) {
        Ok(caller) => caller,
        Err(e) => return RpcResponse::from_store_error(id, &e),
    };

    let engine = BootstrapEngine::new(
        UserRepo::new(state.db.clone()),
        ConversationRepo::new(state.db.clone()),
    );
    let outcome = engine.bootstrap(&caller);
    RpcResponse::success(
        id,
        serde_json::json!({ "ensured": outcome.ensured, "failed": outcome.failed }),
    )
}

// ── Message handlers ──

fn message_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match rpc::require_str(params, "conversation_id") {
        Ok(s) => ConversationId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let messages = MessageRepo::new(state.db.clone());
    match messages.list(&conversation_id, &user_id) {
        Ok(listed) => {
            let payload: Vec<serde_json::Value> = listed.iter().map(wire::message_json).collect();
            RpcResponse::success(id, serde_json::json!({ "messages": payload }))
        }
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

fn message_send(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match rpc::require_str(params, "conversation_id") {
        Ok(s) => ConversationId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let sender_id = match rpc::require_str(params, "sender_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let text = rpc::optional_str(params, "text").unwrap_or_default();
    let kind = match rpc::optional_str(params, "kind") {
        Some(raw) => match raw.parse::<MessageKind>() {
            Ok(kind) => kind,
            Err(e) => return RpcResponse::invalid_params(id, e),
        },
        None => MessageKind::Text,
    };
    let file_ref = match params.get("file_ref") {
        Some(value) => match serde_json::from_value::<FileRef>(value.clone()) {
            Ok(file_ref) => Some(file_ref),
            Err(e) => return RpcResponse::invalid_params(id, format!("file_ref: {e}")),
        },
        None => None,
    };

    let messages = MessageRepo::new(state.db.clone());
    let message = match messages.append(&conversation_id, &sender_id, text, kind, file_ref) {
        Ok(message) => message,
        Err(e) => return RpcResponse::from_store_error(id, &e),
    };

    notify_recipients(state, &conversation_id, &sender_id, &message.body);

    // The authoritative write returns the refreshed aggregate, so clients
    // never have to re-fetch the conversation list for consistency.
    RpcResponse::success(
        id,
        serde_json::json!({
            "message": wire::message_json(&message),
            "conversation": {
                "id": conversation_id,
                "updated_at": message.created_at,
                "last_message": {
                    "text": wire::truncate_subtitle(&message.body),
                    "time": message.created_at,
                },
            },
        }),
    )
}

/// Best-effort notification fan-out to the other participants. Failures are
/// logged, never surfaced: the message itself already committed.
fn notify_recipients(
    state: &Arc<HandlerState>,
    conversation_id: &ConversationId,
    sender_id: &UserId,
    body: &str,
) {
    let conversations = ConversationRepo::new(state.db.clone());
    let notifications = NotificationRepo::new(state.db.clone());

    let conversation = match conversations.get(conversation_id) {
        Ok(conversation) => conversation,
        Err(e) => {
            warn!(conversation_id = %conversation_id, error = %e, "notification fan-out skipped");
            return;
        }
    };

    let sender_name = conversation
        .participants
        .iter()
        .find(|p| &p.user_id == sender_id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| sender_id.to_string());

    for participant in conversation.participants.iter().filter(|p| &p.user_id != sender_id) {
        let result = notifications.create(
            &participant.user_id,
            NotificationKind::Info,
            &format!("New message from {sender_name}"),
            &wire::truncate_subtitle(body),
        );
        if let Err(e) = result {
            warn!(recipient = %participant.user_id, error = %e, "notification create failed");
        }
    }
}

// ── User handlers ──

fn user_search(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let term = match rpc::require_str(params, "term") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let role = match parse_role(params, "user_role") {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_i64(params, "limit").unwrap_or(20).clamp(1, 100) as u32;

    let users = UserRepo::new(state.db.clone());
    match users.search(term, &user_id, role, limit) {
        Ok(found) => {
            let payload: Vec<serde_json::Value> = found.iter().map(wire::user_json).collect();
            RpcResponse::success(id, serde_json::json!({ "users": payload }))
        }
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

// ── Notification handlers ──

fn notification_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let notifications = NotificationRepo::new(state.db.clone());
    let listed = match notifications.list_for_user(&user_id) {
        Ok(listed) => listed,
        Err(e) => return RpcResponse::from_store_error(id, &e),
    };
    let unread = match notifications.unread_count(&user_id) {
        Ok(unread) => unread,
        Err(e) => return RpcResponse::from_store_error(id, &e),
    };

    let now = Utc::now();
    let payload: Vec<serde_json::Value> =
        listed.iter().map(|n| wire::notification_json(n, now)).collect();
    RpcResponse::success(
        id,
        serde_json::json!({ "notifications": payload, "unread_count": unread }),
    )
}

fn notification_mark_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let (notification_id, user_id) = match notification_target(params) {
        Ok(target) => target,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let notifications = NotificationRepo::new(state.db.clone());
    match notifications.mark_read(&notification_id, &user_id) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "updated": true })),
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

fn notification_mark_all_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let notifications = NotificationRepo::new(state.db.clone());
    match notifications.mark_all_read(&user_id) {
        Ok(updated) => RpcResponse::success(id, serde_json::json!({ "updated": updated })),
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

fn notification_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let (notification_id, user_id) = match notification_target(params) {
        Ok(target) => target,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let notifications = NotificationRepo::new(state.db.clone());
    match notifications.delete(&notification_id, &user_id) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "deleted": true })),
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

fn notification_delete_all(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(s) => UserId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let notifications = NotificationRepo::new(state.db.clone());
    match notifications.delete_all(&user_id) {
        Ok(deleted) => RpcResponse::success(id, serde_json::json!({ "deleted": deleted })),
        Err(e) => RpcResponse::from_store_error(id, &e),
    }
}

fn notification_toggle_expanded(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session = match rpc::require_str(params, "session") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let notification_id = match rpc::require_str(params, "notification_id") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let expanded = state.views.toggle(session, notification_id);
    RpcResponse::success(id, serde_json::json!({ "expanded": expanded }))
}

fn notification_target(params: &serde_json::Value) -> Result<(NotificationId, UserId), String> {
    let notification_id = rpc::require_str(params, "notification_id")?;
    let user_id = rpc::require_str(params, "user_id")?;
    Ok((
        NotificationId::from_raw(notification_id),
        UserId::from_raw(user_id),
    ))
}

// ── Session / system handlers ──

fn session_end(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session = match rpc::require_str(params, "session") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    state.views.end_session(session);
    RpcResponse::success(id, serde_json::json!({ "cleared": true }))
}

fn health(id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "service": "backchannel",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}
