use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use backchannel_core::ids::{ConversationId, UserId};
use backchannel_core::Role;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Program,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
            Self::Program => write!(f, "program"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "program" => Ok(Self::Program),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub kind: ConversationKind,
    pub program_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub participants: Vec<Participant>,
}

impl Conversation {
    /// Display title as seen by a viewer: for direct conversations the other
    /// participant's name, otherwise the stored title. Pure projection, the
    /// stored title is never mutated.
    pub fn display_title(&self, viewer: &UserId) -> String {
        if self.kind == ConversationKind::Direct {
            if let Some(other) = self.participants.iter().find(|p| &p.user_id != viewer) {
                return other.name.clone();
            }
        }
        self.title.clone()
    }
}

/// Canonical identity of a direct conversation: the unordered participant
/// pair, materialized as a sorted key backing the UNIQUE constraint.
fn pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a conversation, resolving its kind from the participant count:
    /// exactly one participant besides the creator makes a direct
    /// conversation, more make a group. `program` must be requested
    /// explicitly and carries the external program reference.
    ///
    /// Direct creation is find-or-create: an existing conversation for the
    /// unordered pair is returned as-is. The conversation row and its
    /// participant rows are written inside one critical section, so a
    /// cancelled or failed call never leaves a half-created conversation.
    #[instrument(skip(self, participant_ids), fields(creator = %creator_id))]
    pub fn create(
        &self,
        creator_id: &UserId,
        title: &str,
        participant_ids: &[UserId],
        requested_kind: Option<ConversationKind>,
        program_ref: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::Validation("title must not be blank".into()));
        }
        if participant_ids.is_empty() {
            return Err(StoreError::Validation("participants must not be empty".into()));
        }

        let mut others: Vec<&UserId> = Vec::new();
        for id in participant_ids {
            if id != creator_id && !others.contains(&id) {
                others.push(id);
            }
        }
        if others.is_empty() {
            return Err(StoreError::Validation(
                "conversation needs a participant besides the creator".into(),
            ));
        }

        let kind = match requested_kind {
            Some(ConversationKind::Program) => ConversationKind::Program,
            _ if others.len() == 1 => ConversationKind::Direct,
            _ => ConversationKind::Group,
        };
        let program_ref = match kind {
            ConversationKind::Program => program_ref,
            _ => None,
        };

        self.db.with_conn(|conn| {
            // Participants must exist in the identity mirror.
            for id in std::iter::once(creator_id).chain(others.iter().copied()) {
                let exists: bool = conn
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [id.as_str()], |_| Ok(true))
                    .unwrap_or(false);
                if !exists {
                    return Err(StoreError::NotFound(format!("user {id}")));
                }
            }

            if kind == ConversationKind::Direct {
                let key = pair_key(creator_id, others[0]);
                if let Some(existing) = find_by_pair_key(conn, &key)? {
                    return load_conversation(conn, &existing);
                }

                let id = ConversationId::new();
                let now = Utc::now().to_rfc3339();
                let inserted = conn.execute(
                    "INSERT INTO conversations (id, title, kind, program_ref, pair_key, created_at, updated_at)
                     VALUES (?1, ?2, 'direct', NULL, ?3, ?4, ?4)",
                    rusqlite::params![id.as_str(), title, key, now],
                );
                match inserted {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        // Lost the duplicate-pair race; the winner is the
                        // conversation, not an error.
                        return match find_by_pair_key(conn, &key)? {
                            Some(existing) => load_conversation(conn, &existing),
                            None => Err(StoreError::Conflict(format!("direct pair {key}"))),
                        };
                    }
                    Err(e) => return Err(e.into()),
                }
                insert_participants(conn, &id, creator_id, &others)?;
                load_conversation(conn, &id)
            } else {
                let id = ConversationId::new();
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO conversations (id, title, kind, program_ref, pair_key, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
                    rusqlite::params![id.as_str(), title, kind.to_string(), program_ref, now],
                )?;
                insert_participants(conn, &id, creator_id, &others)?;
                load_conversation(conn, &id)
            }
        })
    }

    /// Get a conversation with its participants.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.db.with_conn(|conn| load_conversation(conn, id))
    }

    pub fn is_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: bool = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id.as_str(), user_id.as_str()],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            Ok(found)
        })
    }

    /// List the caller's conversations, newest activity first.
    ///
    /// Role scoping happens here at read time: callers with role `user` only
    /// see conversations where some other participant is a finance role.
    /// Membership rows are never touched by listing.
    #[instrument(skip(self), fields(caller = %caller_id, caller_role = %caller_role))]
    pub fn list_for_user(
        &self,
        caller_id: &UserId,
        caller_role: Role,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id DESC",
            )?;
            let ids = stmt
                .query_map([caller_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut results = Vec::with_capacity(ids.len());
            for raw in ids {
                results.push(load_conversation(conn, &ConversationId::from_raw(raw))?);
            }
            Ok(results)
        })?;

        if caller_role == Role::User {
            conversations.retain(|c| {
                c.participants
                    .iter()
                    .any(|p| &p.user_id != caller_id && p.role.is_finance())
            });
        }
        Ok(conversations)
    }
}

fn find_by_pair_key(
    conn: &rusqlite::Connection,
    key: &str,
) -> Result<Option<ConversationId>, StoreError> {
    let found = conn
        .query_row(
            "SELECT id FROM conversations WHERE pair_key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        )
        .map(ConversationId::from_raw);
    match found {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn insert_participants(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
    creator_id: &UserId,
    others: &[&UserId],
) -> Result<(), StoreError> {
    for id in std::iter::once(creator_id).chain(others.iter().copied()) {
        conn.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
            [conversation_id.as_str(), id.as_str()],
        )?;
    }
    Ok(())
}

fn load_conversation(
    conn: &rusqlite::Connection,
    id: &ConversationId,
) -> Result<Conversation, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, kind, program_ref, created_at, updated_at
         FROM conversations WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let row = match rows.next()? {
        Some(row) => row,
        None => return Err(StoreError::NotFound(format!("conversation {id}"))),
    };

    let kind_str: String = row_helpers::get(row, 2, "conversations", "kind")?;
    let mut conversation = Conversation {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        title: row_helpers::get(row, 1, "conversations", "title")?,
        kind: row_helpers::parse_enum(&kind_str, "conversations", "kind")?,
        program_ref: row_helpers::get_opt(row, 3, "conversations", "program_ref")?,
        created_at: row_helpers::get(row, 4, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 5, "conversations", "updated_at")?,
        participants: Vec::new(),
    };

    let mut stmt = conn.prepare(
        "SELECT p.user_id, u.name, u.role
         FROM conversation_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY p.user_id ASC",
    )?;
    let mut rows = stmt.query([conversation.id.as_str()])?;
    while let Some(row) = rows.next()? {
        let role_str: String = row_helpers::get(row, 2, "users", "role")?;
        conversation.participants.push(Participant {
            user_id: UserId::from_raw(row_helpers::get::<String>(row, 0, "conversation_participants", "user_id")?),
            name: row_helpers::get(row, 1, "users", "name")?,
            role: row_helpers::parse_enum(&role_str, "users", "role")?,
        });
    }

    Ok(conversation)
}
