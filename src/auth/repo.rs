use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewPrincipal, Principal, PrincipalRow};

const PRINCIPAL_COLUMNS: &str = "id, name, email, password_hash, role, \
     password_changed_at, reset_token_hash, reset_token_expires_at, active";

/// Persistence seam for principals. The authority only touches records
/// through this interface; nothing else writes credential fields.
///
/// Inactive principals are invisible to every lookup here, and
/// `consume_reset_token` must be atomic: of two racing calls with the same
/// still-valid hash, exactly one may observe the token.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_active_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Principal>>;

    /// Lookup by reset-token digest, filtering out expired tokens.
    async fn find_by_reset_hash(&self, hash: &str) -> anyhow::Result<Option<Principal>>;

    /// Insert a new principal. Returns `None` when the email is already
    /// registered (checked atomically with the insert).
    async fn create(&self, new: NewPrincipal) -> anyhow::Result<Option<Principal>>;

    /// Update name and/or email, leaving credential fields untouched.
    /// Returns `None` when the new email already belongs to another record.
    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<Principal>>;

    async fn set_reset_token(
        &self,
        id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    /// Roll back a pending reset (both fields cleared together).
    async fn clear_reset_token(&self, id: Uuid) -> anyhow::Result<()>;

    /// Atomically: find the principal whose unexpired reset digest matches,
    /// install the new password hash, clear both reset fields and record
    /// `changed_at`. Returns `None` when no live token matched, including
    /// when a concurrent call already consumed it.
    async fn consume_reset_token(
        &self,
        hash: &str,
        new_password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<Option<Principal>>;

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    /// Flip `active` off; the record stops matching auth lookups.
    async fn deactivate(&self, id: Uuid) -> anyhow::Result<()>;

    async fn list_active(&self) -> anyhow::Result<Vec<Principal>>;
}

/// Production store backed by Postgres.
pub struct PgCredentialStore {
    db: PgPool,
}

impl PgCredentialStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_active_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE email = $1 AND active"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE id = $1 AND active"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn find_by_reset_hash(&self, hash: &str) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users \
             WHERE reset_token_hash = $1 AND reset_token_expires_at > NOW() AND active"
        ))
        .bind(hash)
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn create(&self, new: NewPrincipal) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "INSERT INTO users (id, name, email, password_hash, role) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (email) DO NOTHING \
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(new.role.as_str())
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<Principal>> {
        // The NOT EXISTS guard keeps the uniqueness check and the write in
        // one statement; a NULL email bind makes the subquery vacuous.
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "UPDATE users SET name = COALESCE($2, name), email = COALESCE($3, email) \
             WHERE id = $1 AND active \
             AND NOT EXISTS (SELECT 1 FROM users other WHERE other.email = $3 AND other.id <> users.id) \
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET reset_token_hash = $2, reset_token_expires_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(hash)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET reset_token_hash = NULL, reset_token_expires_at = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        hash: &str,
        new_password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<Option<Principal>> {
        // Single conditional UPDATE: the row-level lock serializes racing
        // consumers, so the loser no longer matches the WHERE clause.
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "UPDATE users SET password_hash = $2, password_changed_at = $3, \
             reset_token_hash = NULL, reset_token_expires_at = NULL \
             WHERE reset_token_hash = $1 AND reset_token_expires_at > NOW() AND active \
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(hash)
        .bind(new_password_hash)
        .bind(changed_at)
        .fetch_optional(&self.db)
        .await?;
        row.map(Principal::try_from).transpose()
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, password_changed_at = $3 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .bind(changed_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Principal>> {
        let rows = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE active ORDER BY email"
        ))
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Principal::try_from).collect()
    }
}

/// In-memory store used by `AppState::fake()` and tests. A single mutex
/// around the map gives the same serialization guarantee the database
/// provides with its conditional UPDATE.
#[derive(Default)]
pub struct MemoryCredentialStore {
    rows: Mutex<HashMap<Uuid, Principal>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_active_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .find(|p| p.active && p.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Principal>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&id).filter(|p| p.active).cloned())
    }

    async fn find_by_reset_hash(&self, hash: &str) -> anyhow::Result<Option<Principal>> {
        let now = OffsetDateTime::now_utc();
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .find(|p| {
                p.active
                    && p.reset_token_hash.as_deref() == Some(hash)
                    && p.reset_token_expires_at.map(|at| at > now).unwrap_or(false)
            })
            .cloned())
    }

    async fn create(&self, new: NewPrincipal) -> anyhow::Result<Option<Principal>> {
        let mut rows = self.rows.lock().unwrap();
        // Uniqueness spans inactive records too, mirroring the DB constraint.
        if rows.values().any(|p| p.email == new.email) {
            return Ok(None);
        }
        let principal = Principal {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            password_hash: new.password_hash,
            role: new.role,
            password_changed_at: None,
            reset_token_hash: None,
            reset_token_expires_at: None,
            active: true,
        };
        rows.insert(principal.id, principal.clone());
        Ok(Some(principal))
    }

    async fn update_profile(
        &self,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<Principal>> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(email) = email {
            if rows.values().any(|p| p.id != id && p.email == email) {
                return Ok(None);
            }
        }
        Ok(rows.get_mut(&id).filter(|p| p.active).map(|p| {
            if let Some(name) = name {
                p.name = name.to_string();
            }
            if let Some(email) = email {
                p.email = email.to_string();
            }
            p.clone()
        }))
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(p) = rows.get_mut(&id) {
            p.reset_token_hash = Some(hash.to_string());
            p.reset_token_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(p) = rows.get_mut(&id) {
            p.reset_token_hash = None;
            p.reset_token_expires_at = None;
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        hash: &str,
        new_password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<Option<Principal>> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().unwrap();
        let matched = rows.values_mut().find(|p| {
            p.active
                && p.reset_token_hash.as_deref() == Some(hash)
                && p.reset_token_expires_at.map(|at| at > now).unwrap_or(false)
        });
        Ok(matched.map(|p| {
            p.password_hash = new_password_hash.to_string();
            p.password_changed_at = Some(changed_at);
            p.reset_token_hash = None;
            p.reset_token_expires_at = None;
            p.clone()
        }))
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(p) = rows.get_mut(&id) {
            p.password_hash = password_hash.to_string();
            p.password_changed_at = Some(changed_at);
        }
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(p) = rows.get_mut(&id) {
            p.active = false;
        }
        Ok(())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Principal>> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<Principal> = rows.values().filter(|p| p.active).cloned().collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::Role;
    use std::sync::Arc;
    use time::Duration;

    fn new_principal(email: &str) -> NewPrincipal {
        NewPrincipal {
            name: "Ann".into(),
            email: email.into(),
            password_hash: "hash-1".into(),
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn create_and_find_roundtrip() {
        let store = MemoryCredentialStore::new();
        let created = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .expect("created");
        let found = store
            .find_active_by_email("ann@example.com")
            .await
            .unwrap()
            .expect("found");
        assert_eq!(found.id, created.id);
        assert_eq!(found.role, Role::User);
        assert!(store.find_by_id(created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryCredentialStore::new();
        assert!(store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_profile_respects_email_uniqueness() {
        let store = MemoryCredentialStore::new();
        let ann = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        store
            .create(new_principal("bob@example.com"))
            .await
            .unwrap()
            .unwrap();

        let updated = store
            .update_profile(ann.id, Some("Anne"), Some("anne@example.com"))
            .await
            .unwrap()
            .expect("updated");
        assert_eq!(updated.name, "Anne");
        assert_eq!(updated.email, "anne@example.com");
        assert_eq!(updated.password_hash, ann.password_hash);

        // Another record's email is off limits; keeping your own is not.
        assert!(store
            .update_profile(ann.id, None, Some("bob@example.com"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .update_profile(ann.id, None, Some("anne@example.com"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn deactivated_principal_vanishes_from_lookups() {
        let store = MemoryCredentialStore::new();
        let p = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        store.deactivate(p.id).await.unwrap();
        assert!(store
            .find_active_by_email("ann@example.com")
            .await
            .unwrap()
            .is_none());
        assert!(store.find_by_id(p.id).await.unwrap().is_none());
        assert!(store.list_active().await.unwrap().is_empty());
        // But the email stays reserved.
        assert!(store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reset_hash_lookup_applies_expiry_filter() {
        let store = MemoryCredentialStore::new();
        let p = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        let future = OffsetDateTime::now_utc() + Duration::minutes(10);
        store.set_reset_token(p.id, "digest", future).await.unwrap();
        assert!(store.find_by_reset_hash("digest").await.unwrap().is_some());

        let past = OffsetDateTime::now_utc() - Duration::seconds(1);
        store.set_reset_token(p.id, "digest", past).await.unwrap();
        assert!(store.find_by_reset_hash("digest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consume_installs_password_and_clears_reset_fields() {
        let store = MemoryCredentialStore::new();
        let p = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        let future = OffsetDateTime::now_utc() + Duration::minutes(10);
        store.set_reset_token(p.id, "digest", future).await.unwrap();

        let changed_at = OffsetDateTime::now_utc();
        let updated = store
            .consume_reset_token("digest", "hash-2", changed_at)
            .await
            .unwrap()
            .expect("consumed");
        assert_eq!(updated.password_hash, "hash-2");
        assert_eq!(updated.password_changed_at, Some(changed_at));
        assert!(updated.reset_token_hash.is_none());
        assert!(updated.reset_token_expires_at.is_none());
    }

    #[tokio::test]
    async fn consume_rejects_expired_or_unknown_tokens() {
        let store = MemoryCredentialStore::new();
        let p = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .set_reset_token(p.id, "digest", now - Duration::seconds(1))
            .await
            .unwrap();
        assert!(store
            .consume_reset_token("digest", "hash-2", now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .consume_reset_token("no-such-digest", "hash-2", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn racing_consumers_get_exactly_one_winner() {
        let store = Arc::new(MemoryCredentialStore::new());
        let p = store
            .create(new_principal("ann@example.com"))
            .await
            .unwrap()
            .unwrap();
        let future = OffsetDateTime::now_utc() + Duration::minutes(10);
        store.set_reset_token(p.id, "digest", future).await.unwrap();

        let changed_at = OffsetDateTime::now_utc();
        let a = {
            let store = store.clone();
            tokio::spawn(
                async move { store.consume_reset_token("digest", "a", changed_at).await },
            )
        };
        let b = {
            let store = store.clone();
            tokio::spawn(
                async move { store.consume_reset_token("digest", "b", changed_at).await },
            )
        };
        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let winners = results.iter().filter(|r| r.is_some()).count();
        assert_eq!(winners, 1);
    }
}
