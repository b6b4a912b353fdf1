//! Git credential storage.
//!
//! The sync orchestrator only reads credentials through [`CredentialVault`];
//! the SQLite-backed [`DbCredentialVault`] also offers the management calls
//! used by the CLI and the daemon bootstrap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::{queries, Database};
use crate::errors::DatabaseError;
use crate::models::GitCredential;

/// Read access to git credentials for the sync orchestrator.
pub trait CredentialVault: Send + Sync {
    /// Newest credential of `user_id` for `repository_url`, expired or not.
    fn credential_for(
        &self,
        user_id: &str,
        repository_url: &str,
    ) -> Result<Option<GitCredential>, DatabaseError>;

    /// Stamp `last_used_at` after a successful network call.
    fn mark_used(
        &self,
        user_id: &str,
        repository_url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

pub struct DbCredentialVault {
    db: Arc<Database>,
}

impl DbCredentialVault {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn store(&self, credential: &GitCredential) -> Result<(), DatabaseError> {
        self.db
            .transaction(|conn| queries::insert_credential(conn, credential))?;
        info!(
            user_id = %credential.user_id,
            repository_url = %credential.repository_url,
            provider = %credential.provider,
            "stored git credential"
        );
        Ok(())
    }

    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<GitCredential>, DatabaseError> {
        self.db.read(|conn| queries::list_credentials(conn, user_id))
    }

    /// Remove every credential of `user_id` for `repository_url`.
    pub fn remove(&self, user_id: &str, repository_url: &str) -> Result<usize, DatabaseError> {
        let removed = self
            .db
            .transaction(|conn| queries::delete_credentials(conn, user_id, repository_url))?;
        info!(user_id, repository_url, removed, "removed git credentials");
        Ok(removed)
    }
}

impl CredentialVault for DbCredentialVault {
    fn credential_for(
        &self,
        user_id: &str,
        repository_url: &str,
    ) -> Result<Option<GitCredential>, DatabaseError> {
        let credential = self
            .db
            .read(|conn| queries::find_credential(conn, user_id, repository_url))?;
        debug!(user_id, repository_url, found = credential.is_some(), "credential lookup");
        Ok(credential)
    }

    fn mark_used(
        &self,
        user_id: &str,
        repository_url: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.db
            .transaction(|conn| queries::touch_credential(conn, user_id, repository_url, &at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(user: &str, token: &str, expires_at: Option<DateTime<Utc>>) -> GitCredential {
        GitCredential {
            user_id: user.into(),
            provider: "github-enterprise".into(),
            credential_type: "personal-access-token".into(),
            token: token.into(),
            repository_url: "https://git.example.com/plans.git".into(),
            expires_at,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_newest_credential_wins() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let vault = DbCredentialVault::new(db);
        let url = "https://git.example.com/plans.git";

        vault.store(&credential("alice", "old", None)).unwrap();
        let mut newer = credential("alice", "new", Some(Utc::now() + Duration::days(30)));
        newer.created_at = Utc::now() + Duration::seconds(1);
        vault.store(&newer).unwrap();

        let found = vault.credential_for("alice", url).unwrap().unwrap();
        assert_eq!(found.token, "new");
        assert!(vault.credential_for("bob", url).unwrap().is_none());
        assert_eq!(vault.list_for_user("alice").unwrap().len(), 2);

        vault.mark_used("alice", url, Utc::now()).unwrap();
        let found = vault.credential_for("alice", url).unwrap().unwrap();
        assert!(found.last_used_at.is_some());

        assert_eq!(vault.remove("alice", url).unwrap(), 2);
        assert!(vault.credential_for("alice", url).unwrap().is_none());
    }

    #[test]
    fn test_expiry_and_redaction() {
        let now = Utc::now();
        let expired = credential("alice", "s3cret", Some(now - Duration::minutes(1)));
        assert!(expired.is_expired(now));
        assert!(!credential("alice", "t", None).is_expired(now));

        let debug = format!("{expired:?}");
        assert!(!debug.contains("s3cret"));
        let json = serde_json::to_string(&expired).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
