//! Client identity and correlation tokens
//!
//! Every client carries one id for its whole lifetime. Requests draw a fresh
//! token from the same provider; tokens only ever appear in logs and error
//! values, never on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of the client id and per-request tokens
pub trait IdentityProvider: Send + Sync {
    /// Stable id for this client
    fn client_id(&self) -> &str;

    /// Fresh token for one outbound request
    fn next_token(&self) -> String;
}

/// Default identity: `<prefix>-<random>` ids with sequential tokens
#[derive(Debug)]
pub struct TridIdentity {
    base: String,
    seq: AtomicU64,
}

impl TridIdentity {
    pub fn new(prefix: &str) -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self {
            base: format!("{prefix}-{}", &random[..8]),
            seq: AtomicU64::new(0),
        }
    }
}

impl IdentityProvider for TridIdentity {
    fn client_id(&self) -> &str {
        &self.base
    }

    fn next_token(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_client_id_uses_prefix() {
        let identity = TridIdentity::new("workers");
        assert!(identity.client_id().starts_with("workers-"));
        assert_eq!(identity.client_id().len(), "workers-".len() + 8);
    }

    #[test]
    fn test_ids_differ_between_instances() {
        let a = TridIdentity::new("default");
        let b = TridIdentity::new("default");
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_tokens_are_unique_and_scoped() {
        let identity = TridIdentity::new("default");
        let tokens: HashSet<String> = (0..100).map(|_| identity.next_token()).collect();
        assert_eq!(tokens.len(), 100);
        assert!(tokens
            .iter()
            .all(|t| t.starts_with(identity.client_id())));
    }
}
