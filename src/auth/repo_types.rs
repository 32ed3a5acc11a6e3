use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Closed role set; part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Guide,
    LeadGuide,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Guide => "guide",
            Role::LeadGuide => "lead-guide",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "guide" => Ok(Role::Guide),
            "lead-guide" => Ok(Role::LeadGuide),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// Stored identity record. Secret-bearing fields are skipped on
/// serialization and redacted from Debug so they never reach a response or
/// a log line.
#[derive(Clone, Serialize)]
pub struct Principal {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_changed_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub reset_token_hash: Option<String>,
    #[serde(skip_serializing)]
    pub reset_token_expires_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub active: bool,
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("role", &self.role)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Principal {
    /// True when the password was changed after the given token issuance
    /// time, i.e. the token predates the current credentials.
    pub fn changed_password_after(&self, token_iat: usize) -> bool {
        match self.password_changed_at {
            Some(changed_at) => (token_iat as i64) < changed_at.unix_timestamp(),
            None => false,
        }
    }
}

/// Fields for a new record; the caller has already hashed the password and
/// fixed the role at the signup boundary.
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// Raw users row; role is TEXT in the database and decoded strictly.
#[derive(Debug, Clone, FromRow)]
pub struct PrincipalRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub password_changed_at: Option<OffsetDateTime>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<OffsetDateTime>,
    pub active: bool,
}

impl TryFrom<PrincipalRow> for Principal {
    type Error = anyhow::Error;

    fn try_from(row: PrincipalRow) -> Result<Self, Self::Error> {
        Ok(Principal {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            role: row.role.parse()?,
            password_changed_at: row.password_changed_at,
            reset_token_hash: row.reset_token_hash,
            reset_token_expires_at: row.reset_token_expires_at,
            active: row.active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn principal() -> Principal {
        Principal {
            id: Uuid::new_v4(),
            name: "Ann".into(),
            email: "ann@example.com".into(),
            password_hash: "$argon2id$fake".into(),
            role: Role::User,
            password_changed_at: None,
            reset_token_hash: None,
            reset_token_expires_at: None,
            active: true,
        }
    }

    #[test]
    fn role_round_trips_through_wire_names() {
        for role in [Role::User, Role::Guide, Role::LeadGuide, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("superuser".parse::<Role>().is_err());
        assert_eq!(
            serde_json::to_string(&Role::LeadGuide).unwrap(),
            "\"lead-guide\""
        );
    }

    #[test]
    fn serialization_never_exposes_secret_fields() {
        let mut p = principal();
        p.reset_token_hash = Some("deadbeef".into());
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("deadbeef"));
    }

    #[test]
    fn debug_redacts_password_hash() {
        let rendered = format!("{:?}", principal());
        assert!(!rendered.contains("argon2"));
    }

    #[test]
    fn unchanged_password_never_invalidates() {
        let p = principal();
        assert!(!p.changed_password_after(0));
    }

    #[test]
    fn change_invalidates_older_tokens_only() {
        let now = OffsetDateTime::now_utc();
        let mut p = principal();
        p.password_changed_at = Some(now);
        let before = (now - Duration::minutes(5)).unix_timestamp() as usize;
        let after = (now + Duration::minutes(5)).unix_timestamp() as usize;
        assert!(p.changed_password_after(before));
        assert!(!p.changed_password_after(after));
    }
}
