use chrono::Utc;
use tracing::instrument;

use backchannel_core::ids::UserId;
use backchannel_core::{Role, User};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Mirror of the external identity provider. This core never invents users;
/// the surrounding application upserts them here so counterpart selection
/// and search can run locally.
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a user record from the identity provider.
    #[instrument(skip(self), fields(user_id = %id, role = %role))]
    pub fn upsert(
        &self,
        id: &UserId,
        name: &str,
        email: &str,
        role: Role,
    ) -> Result<User, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::Validation("user name must not be blank".into()));
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET name = ?2, email = ?3, role = ?4",
                rusqlite::params![id.as_str(), name, email, role.to_string(), now],
            )?;
            Ok(User {
                id: id.clone(),
                name: name.to_string(),
                email: email.to_string(),
                role,
            })
        })
    }

    /// Get a user by ID.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<User, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, email, role FROM users WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    /// List users holding any of the given roles, ordered by id ascending.
    /// The ascending order is what makes counterpart selection deterministic.
    #[instrument(skip(self, roles))]
    pub fn list_by_roles(&self, roles: &[Role]) -> Result<Vec<User>, StoreError> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let placeholders = (1..=roles.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT id, name, email, role FROM users WHERE role IN ({placeholders}) ORDER BY id ASC"
            );
            let role_strings: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
            let params_refs: Vec<&dyn rusqlite::types::ToSql> = role_strings
                .iter()
                .map(|r| r as &dyn rusqlite::types::ToSql)
                .collect();

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_user(row)?);
            }
            Ok(results)
        })
    }

    /// Search users by name or email substring, excluding the caller.
    ///
    /// The visibility rule for regular users applies here the same as for
    /// conversation listing: callers with role `user` only see finance-role
    /// users in their results.
    #[instrument(skip(self), fields(caller = %caller_id, caller_role = %caller_role))]
    pub fn search(
        &self,
        term: &str,
        caller_id: &UserId,
        caller_role: Role,
        limit: u32,
    ) -> Result<Vec<User>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(term.trim()));
        let mut users = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role FROM users
                 WHERE id != ?1 AND (name LIKE ?2 ESCAPE '\\' OR email LIKE ?2 ESCAPE '\\')
                 ORDER BY name ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![caller_id.as_str(), pattern, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_user(row)?);
            }
            Ok(results)
        })?;

        if caller_role == Role::User {
            users.retain(|u| u.role.is_finance());
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<User, StoreError> {
    let role_str: String = row_helpers::get(row, 3, "users", "role")?;
    Ok(User {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        name: row_helpers::get(row, 1, "users", "name")?,
        email: row_helpers::get(row, 2, "users", "email")?,
        role: row_helpers::parse_enum(&role_str, "users", "role")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    fn seed(repo: &UserRepo, raw_id: &str, name: &str, role: Role) -> User {
        repo.upsert(
            &UserId::from_raw(raw_id),
            name,
            &format!("{raw_id}@example.org"),
            role,
        )
        .unwrap()
    }

    #[test]
    fn upsert_and_get() {
        let repo = repo();
        let user = seed(&repo, "usr_a", "Amara Obi", Role::User);
        let fetched = repo.get(&user.id).unwrap();
        assert_eq!(fetched, user);
    }

    #[test]
    fn upsert_refreshes_role() {
        let repo = repo();
        let user = seed(&repo, "usr_a", "Amara Obi", Role::User);
        repo.upsert(&user.id, "Amara Obi", "usr_a@example.org", Role::Finance)
            .unwrap();
        assert_eq!(repo.get(&user.id).unwrap().role, Role::Finance);
    }

    #[test]
    fn blank_name_is_rejected() {
        let repo = repo();
        let result = repo.upsert(&UserId::new(), "   ", "x@example.org", Role::User);
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = repo();
        let result = repo.get(&UserId::from_raw("usr_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_by_roles_is_ordered_by_id() {
        let repo = repo();
        seed(&repo, "usr_c", "Carol", Role::Finance);
        seed(&repo, "usr_a", "Aldo", Role::FinanceOfficer);
        seed(&repo, "usr_b", "Bea", Role::User);

        let finance = repo
            .list_by_roles(&[Role::Finance, Role::FinanceOfficer, Role::SuperAdmin])
            .unwrap();
        let ids: Vec<&str> = finance.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["usr_a", "usr_c"]);
    }

    #[test]
    fn list_by_empty_roles_is_empty() {
        let repo = repo();
        seed(&repo, "usr_a", "Aldo", Role::User);
        assert!(repo.list_by_roles(&[]).unwrap().is_empty());
    }

    #[test]
    fn search_excludes_caller() {
        let repo = repo();
        let caller = seed(&repo, "usr_a", "Amara", Role::Admin);
        seed(&repo, "usr_b", "Amaranth", Role::User);

        let found = repo.search("Amar", &caller.id, Role::Admin, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "usr_b");
    }

    #[test]
    fn search_matches_email() {
        let repo = repo();
        let caller = seed(&repo, "usr_a", "Amara", Role::Admin);
        seed(&repo, "usr_b", "Bea", Role::User);

        let found = repo.search("usr_b@", &caller.id, Role::Admin, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Bea");
    }

    #[test]
    fn regular_users_only_see_finance_roles() {
        let repo = repo();
        let caller = seed(&repo, "usr_a", "Amara", Role::User);
        seed(&repo, "usr_b", "Bea", Role::User);
        seed(&repo, "usr_c", "Carol", Role::Finance);
        seed(&repo, "usr_d", "Dan", Role::Admin);

        let found = repo.search("", &caller.id, Role::User, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "usr_c");
    }

    #[test]
    fn like_wildcards_are_escaped() {
        let repo = repo();
        let caller = seed(&repo, "usr_a", "Amara", Role::Admin);
        seed(&repo, "usr_b", "Bea", Role::User);

        // A bare "%" must not match everything once escaped.
        let found = repo.search("%", &caller.id, Role::Admin, 10).unwrap();
        assert!(found.is_empty());
    }
}
