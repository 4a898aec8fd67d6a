use serde::{Deserialize, Serialize};

/// Closed set of organizational roles. Role is immutable within a session and
/// is the sole admission-control input for visibility and bootstrap policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Finance,
    FinanceOfficer,
    SuperAdmin,
}

impl Role {
    /// Roles that count as a finance counterpart for visibility scoping.
    /// Defined once so the set cannot drift between call sites.
    pub fn is_finance(self) -> bool {
        matches!(self, Self::Finance | Self::FinanceOfficer | Self::SuperAdmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
            Self::Finance => write!(f, "finance"),
            Self::FinanceOfficer => write!(f, "finance_officer"),
            Self::SuperAdmin => write!(f, "super_admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "finance" => Ok(Self::Finance),
            "finance_officer" => Ok(Self::FinanceOfficer),
            "super_admin" => Ok(Self::SuperAdmin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}
