//! Read-through cache for credential status lookups.
//!
//! Entries are only ever written after a durable write (or a fresh read)
//! succeeded, and nothing that mutates a credential consults it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::models::Credential;

pub struct CredentialCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Credential, Instant)>>,
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, reference: &str) -> Option<Credential> {
        let entries = self.entries.read().await;
        entries
            .get(reference)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(cred, _)| cred.clone())
    }

    pub async fn put(&self, credential: &Credential) {
        self.entries.write().await.insert(
            credential.transaction_reference.clone(),
            (credential.clone(), Instant::now()),
        );
    }

    pub async fn invalidate(&self, reference: &str) {
        self.entries.write().await.remove(reference);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop entries older than the TTL.
    pub async fn prune(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CredentialStatus;

    fn credential(reference: &str) -> Credential {
        Credential {
            id: 1,
            transaction_reference: reference.into(),
            secret_hash: "h".into(),
            liters: 5.0,
            status: CredentialStatus::Active,
            station_id: None,
            attempts: 0,
            max_attempts: 3,
            expires_at: 0,
            verified_at: None,
            used_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn put_get_invalidate() {
        let cache = CredentialCache::new(Duration::from_secs(60));
        cache.put(&credential("A")).await;
        assert!(cache.get("A").await.is_some());
        cache.invalidate("A").await;
        assert!(cache.get("A").await.is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = CredentialCache::new(Duration::ZERO);
        cache.put(&credential("A")).await;
        assert!(cache.get("A").await.is_none());
        assert_eq!(cache.prune().await, 1);
    }
}
