use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use backchannel_core::ids::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    System,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::File => write!(f, "file"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "file" => Ok(Self::File),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Opaque attachment reference; storage mechanics live elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub name: String,
    pub size: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub file_ref: Option<FileRef>,
    pub created_at: String,
    pub read_by: Vec<UserId>,
}

/// Last-message projection consumed by the conversation directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastMessage {
    pub body: String,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. Only participants may send; the sender implicitly
    /// has read their own message; the conversation's `updated_at` is bumped
    /// in the same critical section.
    #[instrument(skip(self, body, file_ref), fields(conversation_id = %conversation_id, sender = %sender_id, kind = %kind))]
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
        kind: MessageKind,
        file_ref: Option<FileRef>,
    ) -> Result<Message, StoreError> {
        if kind == MessageKind::Text && body.trim().is_empty() {
            return Err(StoreError::Validation("message text must not be empty".into()));
        }

        self.db.with_conn(|conn| {
            ensure_conversation(conn, conversation_id)?;
            ensure_participant(conn, conversation_id, sender_id)?;

            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            let (file_url, file_name, file_size) = match &file_ref {
                Some(f) => (Some(f.url.as_str()), Some(f.name.as_str()), Some(f.size)),
                None => (None, None, None),
            };

            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, kind, body, file_url, file_name, file_size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    sender_id.as_str(),
                    kind.to_string(),
                    body,
                    file_url,
                    file_name,
                    file_size,
                    now,
                ],
            )?;
            conn.execute(
                "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), sender_id.as_str(), now],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id.as_str()],
            )?;

            Ok(Message {
                id,
                conversation_id: conversation_id.clone(),
                sender_id: sender_id.clone(),
                kind,
                body: body.to_string(),
                file_ref,
                created_at: now,
                read_by: vec![sender_id.clone()],
            })
        })
    }

    /// List a conversation's messages in creation order. Listing never
    /// mutates read state.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, viewer = %viewer_id))]
    pub fn list(
        &self,
        conversation_id: &ConversationId,
        viewer_id: &UserId,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            ensure_conversation(conn, conversation_id)?;
            ensure_participant(conn, conversation_id, viewer_id)?;

            let mut reads: HashMap<String, Vec<UserId>> = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id FROM message_reads
                 WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)
                 ORDER BY user_id ASC",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            while let Some(row) = rows.next()? {
                let message_id: String = row_helpers::get(row, 0, "message_reads", "message_id")?;
                let user_id: String = row_helpers::get(row, 1, "message_reads", "user_id")?;
                reads.entry(message_id).or_default().push(UserId::from_raw(user_id));
            }

            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, kind, body, file_url, file_name, file_size, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                let mut message = row_to_message(row)?;
                message.read_by = reads.remove(message.id.as_str()).unwrap_or_default();
                messages.push(message);
            }
            Ok(messages)
        })
    }

    /// Mark every message in the conversation as read by the viewer.
    ///
    /// This is the conversation-level read marking the application invokes
    /// when a viewer opens a conversation. INSERT OR IGNORE keeps `read_by`
    /// strictly monotonic and the call idempotent. Returns the number of
    /// messages newly marked.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, viewer = %viewer_id))]
    pub fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        viewer_id: &UserId,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            ensure_conversation(conn, conversation_id)?;
            ensure_participant(conn, conversation_id, viewer_id)?;

            let now = Utc::now().to_rfc3339();
            let marked = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT id, ?2, ?3 FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2",
                rusqlite::params![conversation_id.as_str(), viewer_id.as_str(), now],
            )?;
            Ok(marked)
        })
    }

    /// Unread count projection: messages from other senders the viewer has
    /// not read. Derived, never stored.
    pub fn unread_count(
        &self,
        conversation_id: &ConversationId,
        viewer_id: &UserId,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.conversation_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (
                     SELECT 1 FROM message_reads r
                     WHERE r.message_id = m.id AND r.user_id = ?2
                   )",
                [conversation_id.as_str(), viewer_id.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }

    /// Most recent message of a conversation, if any.
    pub fn last_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<LastMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn.query_row(
                "SELECT body, created_at FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                [conversation_id.as_str()],
                |row| {
                    Ok(LastMessage {
                        body: row.get(0)?,
                        created_at: row.get(1)?,
                    })
                },
            );
            match found {
                Ok(last) => Ok(Some(last)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

fn ensure_conversation(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
) -> Result<(), StoreError> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            [conversation_id.as_str()],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if exists {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("conversation {conversation_id}")))
    }
}

fn ensure_participant(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<(), StoreError> {
    let member: bool = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id.as_str(), user_id.as_str()],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if member {
        Ok(())
    } else {
        Err(StoreError::Forbidden(format!(
            "user {user_id} is not a participant of {conversation_id}"
        )))
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let kind_str: String = row_helpers::get(row, 3, "messages", "kind")?;
    let file_url: Option<String> = row_helpers::get_opt(row, 5, "messages", "file_url")?;
    let file_ref = match file_url {
        Some(url) => Some(FileRef {
            url,
            name: row_helpers::get_opt(row, 6, "messages", "file_name")?.unwrap_or_default(),
            size: row_helpers::get_opt(row, 7, "messages", "file_size")?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "messages", "conversation_id",
        )?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "sender_id")?),
        kind: row_helpers::parse_enum(&kind_str, "messages", "kind")?,
        body: row_helpers::get(row, 4, "messages", "body")?,
        file_ref,
        created_at: row_helpers::get(row, 8, "messages", "created_at")?,
        read_by: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use crate::users::UserRepo;
    use backchannel_core::Role;

    struct Fixture {
        conversations: ConversationRepo,
        messages: MessageRepo,
        a: UserId,
        f: UserId,
        conv: ConversationId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let conversations = ConversationRepo::new(db.clone());
        let messages = MessageRepo::new(db.clone());

        let a = users
            .upsert(&UserId::from_raw("usr_a"), "Amara", "a@example.org", Role::User)
            .unwrap()
            .id;
        let f = users
            .upsert(&UserId::from_raw("usr_f"), "Folu", "f@example.org", Role::Finance)
            .unwrap()
            .id;
        let conv = conversations
            .create(&a, "Finance desk", &[f.clone()], None, None)
            .unwrap()
            .id;

        Fixture { conversations, messages, a, f, conv }
    }

    #[test]
    fn append_seeds_read_by_with_sender() {
        let fx = setup();
        let message = fx
            .messages
            .append(&fx.conv, &fx.a, "Hello", MessageKind::Text, None)
            .unwrap();
        assert_eq!(message.read_by, vec![fx.a.clone()]);
        assert_eq!(message.kind, MessageKind::Text);
    }

    #[test]
    fn append_bumps_conversation_updated_at() {
        let fx = setup();
        let before = fx.conversations.get(&fx.conv).unwrap().updated_at;
        fx.messages
            .append(&fx.conv, &fx.a, "Hello", MessageKind::Text, None)
            .unwrap();
        let after = fx.conversations.get(&fx.conv).unwrap().updated_at;
        assert!(after >= before);

        let last = fx.messages.last_message(&fx.conv).unwrap().unwrap();
        assert_eq!(last.body, "Hello");
        assert_eq!(last.created_at, after);
    }

    #[test]
    fn empty_text_is_rejected() {
        let fx = setup();
        let result = fx.messages.append(&fx.conv, &fx.a, "  ", MessageKind::Text, None);
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn file_message_may_have_empty_body() {
        let fx = setup();
        let file = FileRef {
            url: "https://files.example.org/report.pdf".into(),
            name: "report.pdf".into(),
            size: 81234,
        };
        let message = fx
            .messages
            .append(&fx.conv, &fx.a, "", MessageKind::File, Some(file.clone()))
            .unwrap();
        assert_eq!(message.file_ref, Some(file.clone()));

        let listed = fx.messages.list(&fx.conv, &fx.f).unwrap();
        assert_eq!(listed[0].file_ref, Some(file));
    }

    #[test]
    fn non_participant_cannot_append() {
        let fx = setup();
        let outsider = UserId::from_raw("usr_outsider");
        let result = fx
            .messages
            .append(&fx.conv, &outsider, "hi", MessageKind::Text, None);
        assert!(matches!(result, Err(StoreError::Forbidden(_))));
    }

    #[test]
    fn non_participant_cannot_list() {
        let fx = setup();
        let outsider = UserId::from_raw("usr_outsider");
        let result = fx.messages.list(&fx.conv, &outsider);
        assert!(matches!(result, Err(StoreError::Forbidden(_))));
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let fx = setup();
        let ghost = ConversationId::from_raw("conv_ghost");
        let result = fx.messages.append(&ghost, &fx.a, "hi", MessageKind::Text, None);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_is_ordered_and_stable() {
        let fx = setup();
        for i in 0..5 {
            fx.messages
                .append(&fx.conv, &fx.a, &format!("message {i}"), MessageKind::Text, None)
                .unwrap();
        }

        let first = fx.messages.list(&fx.conv, &fx.a).unwrap();
        let bodies: Vec<&str> = first.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["message 0", "message 1", "message 2", "message 3", "message 4"]);
        for w in first.windows(2) {
            assert!(w[0].created_at <= w[1].created_at);
            assert!(w[0].id < w[1].id);
        }

        // Repeated calls must not reorder anything.
        let second = fx.messages.list(&fx.conv, &fx.a).unwrap();
        let ids_first: Vec<&str> = first.iter().map(|m| m.id.as_str()).collect();
        let ids_second: Vec<&str> = second.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[test]
    fn listing_does_not_mark_read() {
        let fx = setup();
        fx.messages
            .append(&fx.conv, &fx.a, "Hello", MessageKind::Text, None)
            .unwrap();

        fx.messages.list(&fx.conv, &fx.f).unwrap();
        fx.messages.list(&fx.conv, &fx.f).unwrap();
        assert_eq!(fx.messages.unread_count(&fx.conv, &fx.f).unwrap(), 1);
    }

    #[test]
    fn unread_counts_exclude_own_messages() {
        let fx = setup();
        fx.messages
            .append(&fx.conv, &fx.a, "Hello", MessageKind::Text, None)
            .unwrap();
        assert_eq!(fx.messages.unread_count(&fx.conv, &fx.a).unwrap(), 0);
        assert_eq!(fx.messages.unread_count(&fx.conv, &fx.f).unwrap(), 1);
    }

    #[test]
    fn mark_conversation_read_is_idempotent() {
        let fx = setup();
        fx.messages
            .append(&fx.conv, &fx.a, "one", MessageKind::Text, None)
            .unwrap();
        fx.messages
            .append(&fx.conv, &fx.a, "two", MessageKind::Text, None)
            .unwrap();

        let marked = fx.messages.mark_conversation_read(&fx.conv, &fx.f).unwrap();
        assert_eq!(marked, 2);
        assert_eq!(fx.messages.unread_count(&fx.conv, &fx.f).unwrap(), 0);

        let again = fx.messages.mark_conversation_read(&fx.conv, &fx.f).unwrap();
        assert_eq!(again, 0);
        assert_eq!(fx.messages.unread_count(&fx.conv, &fx.f).unwrap(), 0);
    }

    #[test]
    fn read_by_only_grows() {
        let fx = setup();
        let message = fx
            .messages
            .append(&fx.conv, &fx.a, "Hello", MessageKind::Text, None)
            .unwrap();

        fx.messages.mark_conversation_read(&fx.conv, &fx.f).unwrap();
        let listed = fx.messages.list(&fx.conv, &fx.a).unwrap();
        let read_by = &listed.iter().find(|m| m.id == message.id).unwrap().read_by;
        assert!(read_by.contains(&fx.a));
        assert!(read_by.contains(&fx.f));

        // Marking again never removes anyone.
        fx.messages.mark_conversation_read(&fx.conv, &fx.f).unwrap();
        let listed = fx.messages.list(&fx.conv, &fx.a).unwrap();
        assert_eq!(listed[0].read_by.len(), 2);
    }

    #[test]
    fn last_message_of_empty_conversation_is_none() {
        let fx = setup();
        assert!(fx.messages.last_message(&fx.conv).unwrap().is_none());
    }
}
