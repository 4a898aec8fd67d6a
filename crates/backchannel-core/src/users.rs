use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::roles::Role;

/// A directory user as supplied by the identity provider. Read-only to this
/// core; the store keeps a mirror for search and bootstrap counterpart
/// selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_roundtrip() {
        let user = User {
            id: UserId::from_raw("usr_a"),
            name: "Amara Obi".into(),
            email: "amara@example.org".into(),
            role: Role::FinanceOfficer,
        };
        let json = serde_json::to_string(&user).unwrap();
        let parsed: User = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, user);
        assert!(json.contains("\"finance_officer\""));
    }
}
