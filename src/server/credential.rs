//! Accounts the proxy accepts from its own clients.
//!
//! These are the fake identities, never the real database credential.

use dashmap::DashMap;
use zeroize::Zeroizing;

/// Username → password lookup consulted during the client handshake.
///
/// Implementations must be safe to share between every session task.
pub trait CredentialProvider: Send + Sync {
    /// Register or replace an account.
    fn add_user(&self, username: &str, password: &str);

    fn check_username(&self, username: &str) -> bool;

    /// Plaintext password for `username`, wiped when the caller drops it.
    fn get_credential(&self, username: &str) -> Option<Zeroizing<String>>;
}

/// [`CredentialProvider`] backed by a concurrent map. Entries never expire.
#[derive(Default)]
pub struct InMemoryProvider {
    users: DashMap<String, Zeroizing<String>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding a single account, the usual fake-identity setup.
    pub fn with_user(username: &str, password: &str) -> Self {
        let provider = Self::new();
        provider.add_user(username, password);
        provider
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialProvider for InMemoryProvider {
    fn add_user(&self, username: &str, password: &str) {
        self.users
            .insert(username.to_string(), Zeroizing::new(password.to_string()));
    }

    fn check_username(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    fn get_credential(&self, username: &str) -> Option<Zeroizing<String>> {
        self.users.get(username).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("users", &self.users.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_lookup() {
        let provider = InMemoryProvider::with_user("proxyuser", "secret");
        assert!(provider.check_username("proxyuser"));
        assert!(!provider.check_username("root"));
        assert_eq!(
            provider.get_credential("proxyuser").as_deref().map(String::as_str),
            Some("secret")
        );
        assert!(provider.get_credential("root").is_none());
    }

    #[test]
    fn test_add_replaces_password() {
        let provider = InMemoryProvider::new();
        assert!(provider.is_empty());
        provider.add_user("app", "one");
        provider.add_user("app", "two");
        assert_eq!(provider.len(), 1);
        assert_eq!(provider.get_credential("app").unwrap().as_str(), "two");
    }

    #[test]
    fn test_debug_hides_passwords() {
        let provider = InMemoryProvider::with_user("proxyuser", "hunter2");
        let rendered = format!("{:?}", provider);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("proxyuser"));
    }

    #[tokio::test]
    async fn test_concurrent_add_and_lookup() {
        let provider: Arc<dyn CredentialProvider> = Arc::new(InMemoryProvider::new());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let provider = Arc::clone(&provider);
            tasks.push(tokio::spawn(async move {
                let name = format!("user{}", i);
                provider.add_user(&name, "pw");
                for _ in 0..100 {
                    assert!(provider.check_username(&name));
                    let _ = provider.get_credential("user0");
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for i in 0..8 {
            assert!(provider.check_username(&format!("user{}", i)));
        }
    }
}
