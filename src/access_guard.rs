use std::collections::HashSet;

use crate::config::AccessConfig;

/// Allowlist policy for operator commands. Evaluation is a pure membership
/// check so it can be audited and tested without any runtime state.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed_user_ids: HashSet<u64>,
    allowed_role_ids: HashSet<u64>,
    whitelist_disabled: bool,
}

impl AccessPolicy {
    pub fn new(
        allowed_user_ids: impl IntoIterator<Item = u64>,
        allowed_role_ids: impl IntoIterator<Item = u64>,
        whitelist_disabled: bool,
    ) -> Self {
        Self {
            allowed_user_ids: allowed_user_ids.into_iter().collect(),
            allowed_role_ids: allowed_role_ids.into_iter().collect(),
            whitelist_disabled,
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(
            config.allowed_user_ids.iter().copied(),
            config.allowed_role_ids.iter().copied(),
            config.whitelist_disabled,
        )
    }

    /// True when the invoker may run commands: the whitelist is disabled, the
    /// user id is listed, or any of the invoker's roles is listed.
    pub fn authorize(&self, invoker_id: u64, invoker_role_ids: &[u64]) -> bool {
        if self.whitelist_disabled {
            return true;
        }
        if self.allowed_user_ids.contains(&invoker_id) {
            return true;
        }
        invoker_role_ids
            .iter()
            .any(|role| self.allowed_role_ids.contains(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_listed_user() {
        let policy = AccessPolicy::new([100, 200], [], false);
        assert!(policy.authorize(100, &[]));
        assert!(!policy.authorize(300, &[]));
    }

    #[test]
    fn test_allows_by_role_intersection() {
        let policy = AccessPolicy::new([], [10, 20], false);
        assert!(policy.authorize(999, &[5, 20]));
        assert!(!policy.authorize(999, &[5, 6]));
        assert!(!policy.authorize(999, &[]));
    }

    #[test]
    fn test_disabled_whitelist_allows_everyone() {
        let policy = AccessPolicy::new([], [], true);
        assert!(policy.authorize(42, &[]));
    }

    #[test]
    fn test_empty_allowlists_deny_everyone() {
        let policy = AccessPolicy::new([], [], false);
        assert!(!policy.authorize(42, &[1, 2, 3]));
    }
}
