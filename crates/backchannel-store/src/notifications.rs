use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use backchannel_core::ids::{NotificationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct NotificationRepo {
    db: Database,
}

impl NotificationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a notification for a recipient. Internal surface, invoked by
    /// the message-send flow; not exposed as an RPC method.
    #[instrument(skip(self, title, body), fields(user_id = %user_id, kind = %kind))]
    pub fn create(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        title: &str,
        body: &str,
    ) -> Result<Notification, StoreError> {
        if title.trim().is_empty() {
            return Err(StoreError::Validation("notification title must not be blank".into()));
        }
        let id = NotificationId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, kind, title, body, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                rusqlite::params![
                    id.as_str(),
                    user_id.as_str(),
                    kind.to_string(),
                    title,
                    body,
                    now
                ],
            )?;
            Ok(Notification {
                id,
                user_id: user_id.clone(),
                kind,
                title: title.to_string(),
                body: body.to_string(),
                is_read: false,
                created_at: now,
            })
        })
    }

    /// List a user's notifications, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Notification>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, title, body, is_read, created_at
                 FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_notification(row)?);
            }
            Ok(results)
        })
    }

    /// Mark one notification read. Idempotent: an already-read notification
    /// is a no-op. Only the owner may mark their notifications.
    #[instrument(skip(self), fields(notification_id = %id, caller = %caller_id))]
    pub fn mark_read(&self, id: &NotificationId, caller_id: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            ensure_owner(conn, id, caller_id)?;
            conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND is_read = 0",
                [id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark all of the caller's notifications read. Returns how many changed;
    /// a second call is a fixed point.
    #[instrument(skip(self), fields(caller = %caller_id))]
    pub fn mark_all_read(&self, caller_id: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [caller_id.as_str()],
            )?;
            Ok(changed)
        })
    }

    /// Delete one notification, permanently. Unknown ids (including already
    /// deleted ones) are NotFound, foreign ones Forbidden.
    #[instrument(skip(self), fields(notification_id = %id, caller = %caller_id))]
    pub fn delete(&self, id: &NotificationId, caller_id: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            ensure_owner(conn, id, caller_id)?;
            conn.execute("DELETE FROM notifications WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    /// Delete all of the caller's notifications. Returns how many went.
    #[instrument(skip(self), fields(caller = %caller_id))]
    pub fn delete_all(&self, caller_id: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications WHERE user_id = ?1",
                [caller_id.as_str()],
            )?;
            Ok(deleted)
        })
    }

    /// Unread badge count.
    pub fn unread_count(&self, user_id: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user_id.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

fn ensure_owner(
    conn: &rusqlite::Connection,
    id: &NotificationId,
    caller_id: &UserId,
) -> Result<(), StoreError> {
    let owner: Option<String> = match conn.query_row(
        "SELECT user_id FROM notifications WHERE id = ?1",
        [id.as_str()],
        |row| row.get(0),
    ) {
        Ok(owner) => Some(owner),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    match owner {
        None => Err(StoreError::NotFound(format!("notification {id}"))),
        Some(owner) if owner != caller_id.as_str() => Err(StoreError::Forbidden(format!(
            "notification {id} belongs to another user"
        ))),
        Some(_) => Ok(()),
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> Result<Notification, StoreError> {
    let kind_str: String = row_helpers::get(row, 2, "notifications", "kind")?;
    Ok(Notification {
        id: NotificationId::from_raw(row_helpers::get::<String>(row, 0, "notifications", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "notifications", "user_id")?),
        kind: row_helpers::parse_enum(&kind_str, "notifications", "kind")?,
        title: row_helpers::get(row, 3, "notifications", "title")?,
        body: row_helpers::get(row, 4, "notifications", "body")?,
        is_read: row_helpers::get::<i64>(row, 5, "notifications", "is_read")? != 0,
        created_at: row_helpers::get(row, 6, "notifications", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (NotificationRepo, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        (
            NotificationRepo::new(db),
            UserId::from_raw("usr_a"),
            UserId::from_raw("usr_b"),
        )
    }

    #[test]
    fn create_and_list_newest_first() {
        let (repo, a, _) = setup();
        repo.create(&a, NotificationKind::Info, "first", "body").unwrap();
        repo.create(&a, NotificationKind::Success, "second", "body").unwrap();

        let listed = repo.list_for_user(&a).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "second");
        assert_eq!(listed[1].title, "first");
        assert!(!listed[0].is_read);
    }

    #[test]
    fn blank_title_is_rejected() {
        let (repo, a, _) = setup();
        let result = repo.create(&a, NotificationKind::Info, " ", "body");
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn list_is_scoped_to_owner() {
        let (repo, a, b) = setup();
        repo.create(&a, NotificationKind::Info, "for a", "body").unwrap();
        repo.create(&b, NotificationKind::Info, "for b", "body").unwrap();

        let listed = repo.list_for_user(&a).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "for a");
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (repo, a, _) = setup();
        let n = repo.create(&a, NotificationKind::Warning, "t", "b").unwrap();

        repo.mark_read(&n.id, &a).unwrap();
        assert!(repo.list_for_user(&a).unwrap()[0].is_read);

        // Marking again is a no-op, not an error.
        repo.mark_read(&n.id, &a).unwrap();
        assert!(repo.list_for_user(&a).unwrap()[0].is_read);
    }

    #[test]
    fn mark_read_foreign_notification_is_forbidden() {
        let (repo, a, b) = setup();
        let n = repo.create(&a, NotificationKind::Info, "t", "b").unwrap();
        let result = repo.mark_read(&n.id, &b);
        assert!(matches!(result, Err(StoreError::Forbidden(_))));
        assert!(!repo.list_for_user(&a).unwrap()[0].is_read);
    }

    #[test]
    fn mark_all_read_twice_is_fixed_point() {
        let (repo, a, _) = setup();
        repo.create(&a, NotificationKind::Info, "one", "b").unwrap();
        repo.create(&a, NotificationKind::Info, "two", "b").unwrap();

        assert_eq!(repo.mark_all_read(&a).unwrap(), 2);
        assert_eq!(repo.unread_count(&a).unwrap(), 0);
        assert_eq!(repo.mark_all_read(&a).unwrap(), 0);
        assert_eq!(repo.unread_count(&a).unwrap(), 0);
    }

    #[test]
    fn delete_removes_permanently() {
        let (repo, a, _) = setup();
        let n = repo.create(&a, NotificationKind::Error, "t", "b").unwrap();
        repo.delete(&n.id, &a).unwrap();
        assert!(repo.list_for_user(&a).unwrap().is_empty());

        // Deleting again reports NotFound rather than crashing.
        let result = repo.delete(&n.id, &a);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_foreign_notification_is_forbidden() {
        let (repo, a, b) = setup();
        let n = repo.create(&a, NotificationKind::Info, "t", "b").unwrap();
        let result = repo.delete(&n.id, &b);
        assert!(matches!(result, Err(StoreError::Forbidden(_))));
        assert_eq!(repo.list_for_user(&a).unwrap().len(), 1);
    }

    #[test]
    fn delete_all_is_scoped_to_owner() {
        let (repo, a, b) = setup();
        repo.create(&a, NotificationKind::Info, "one", "b").unwrap();
        repo.create(&a, NotificationKind::Info, "two", "b").unwrap();
        repo.create(&b, NotificationKind::Info, "keep", "b").unwrap();

        assert_eq!(repo.delete_all(&a).unwrap(), 2);
        assert!(repo.list_for_user(&a).unwrap().is_empty());
        assert_eq!(repo.list_for_user(&b).unwrap().len(), 1);
    }

    #[test]
    fn unread_count_tracks_reads() {
        let (repo, a, _) = setup();
        let n = repo.create(&a, NotificationKind::Info, "one", "b").unwrap();
        repo.create(&a, NotificationKind::Info, "two", "b").unwrap();

        assert_eq!(repo.unread_count(&a).unwrap(), 2);
        repo.mark_read(&n.id, &a).unwrap();
        assert_eq!(repo.unread_count(&a).unwrap(), 1);
    }
}
