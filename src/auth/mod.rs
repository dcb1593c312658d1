//! Permission providers
//!
//! The core consumes one interface: authenticate a connecting client and
//! answer whether a client may connect, publish or subscribe. Providers here
//! cover the built-in cases (allow-all, config users + ACL rules); anything
//! richer plugs in behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AclConfig, AuthConfig};
use crate::shared::SharedStore;

const ACL_RULES_KEY: &str = "dynamq:acl:rules";

/// Operation being permission-checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    Publish,
    Subscribe,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
        }
    }
}

/// Interface consumed by the connection handlers
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Verify CONNECT credentials
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool;

    /// Whether the operation is allowed. `topic` is empty for Connect.
    async fn check(
        &self,
        client_id: &str,
        username: Option<&str>,
        action: Action,
        topic: &str,
    ) -> bool;
}

/// Provider that allows everything (auth disabled)
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionProvider for AllowAllPermissions {
    async fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> bool {
        true
    }

    async fn check(&self, _: &str, _: Option<&str>, _: Action, _: &str) -> bool {
        true
    }
}

/// One access-control rule. Rules are ordered by priority (higher first);
/// the first matching rule decides. No matching rule means allow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclRule {
    #[serde(default)]
    pub id: Option<String>,
    /// Client id pattern: exact, `*`, `prefix*` or `*suffix`
    #[serde(default)]
    pub client_id_pattern: Option<String>,
    /// Username pattern, same syntax
    #[serde(default)]
    pub username_pattern: Option<String>,
    /// `connect`, `publish`, `subscribe` or `*`
    pub action: String,
    /// MQTT topic pattern with `+`/`#` wildcards
    #[serde(default)]
    pub topic_pattern: Option<String>,
    pub allow: bool,
    #[serde(default)]
    pub priority: i32,
}

impl AclRule {
    fn matches(&self, client_id: &str, username: Option<&str>, action: Action, topic: &str) -> bool {
        if self.action != "*" && !self.action.eq_ignore_ascii_case(action.as_str()) {
            return false;
        }

        if !matches_pattern(self.client_id_pattern.as_deref(), Some(client_id)) {
            return false;
        }

        if !matches_pattern(self.username_pattern.as_deref(), username) {
            return false;
        }

        if !topic.is_empty() {
            if let Some(ref pattern) = self.topic_pattern {
                if !pattern.is_empty() && !crate::topic::topic_matches_filter(topic, pattern) {
                    return false;
                }
            }
        }

        true
    }
}

/// Exact, `*`, `prefix*` or `*suffix` matching
fn matches_pattern(pattern: Option<&str>, value: Option<&str>) -> bool {
    let pattern = match pattern {
        Some(p) if !p.is_empty() && p != "*" => p,
        _ => return true,
    };
    let value = match value {
        Some(v) => v,
        None => return false,
    };

    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }
    pattern == value
}

/// Config-backed provider: username/password table plus ordered ACL rules.
/// The rule list can be refreshed from the shared store.
pub struct StaticPermissions {
    auth_enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, String>,
    acl_enabled: bool,
    rules: RwLock<Vec<AclRule>>,
}

impl StaticPermissions {
    pub fn new(auth: &AuthConfig, acl: &AclConfig) -> Self {
        let users = auth
            .users
            .iter()
            .map(|user| (user.username.clone(), user.password.clone()))
            .collect();

        let mut rules = acl.rules.clone();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            auth_enabled: auth.enabled,
            allow_anonymous: auth.allow_anonymous,
            users,
            acl_enabled: acl.enabled,
            rules: RwLock::new(rules),
        }
    }

    /// Replace the rule list from `dynamq:acl:rules` when present
    pub async fn load_rules_from_store(&self, store: &SharedStore) {
        match store.get(ACL_RULES_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<AclRule>>(&json) {
                Ok(mut rules) => {
                    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                    info!("Loaded {} ACL rules from shared store", rules.len());
                    *self.rules.write() = rules;
                }
                Err(e) => warn!("Failed to parse stored ACL rules: {}", e),
            },
            Ok(None) => debug!("No ACL rules in shared store"),
            Err(e) => warn!("Failed to load ACL rules: {}", e),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        if !self.auth_enabled {
            return true;
        }

        let username = match username {
            Some(name) => name,
            None => return self.allow_anonymous,
        };

        let stored = match self.users.get(username) {
            Some(stored) => stored,
            None => return false,
        };

        match password.map(std::str::from_utf8) {
            Some(Ok(given)) => given == stored,
            _ => false,
        }
    }

    async fn check(
        &self,
        client_id: &str,
        username: Option<&str>,
        action: Action,
        topic: &str,
    ) -> bool {
        if !self.acl_enabled {
            return true;
        }

        let rules = self.rules.read();
        for rule in rules.iter() {
            if rule.matches(client_id, username, action, topic) {
                return rule.allow;
            }
        }

        // No matching rule: allow
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;

    fn rule(action: &str, topic: Option<&str>, allow: bool) -> AclRule {
        AclRule {
            id: None,
            client_id_pattern: None,
            username_pattern: None,
            action: action.to_string(),
            topic_pattern: topic.map(|s| s.to_string()),
            allow,
            priority: 0,
        }
    }

    fn provider(auth_enabled: bool, acl_rules: Vec<AclRule>) -> StaticPermissions {
        StaticPermissions::new(
            &AuthConfig {
                enabled: auth_enabled,
                allow_anonymous: false,
                users: vec![UserEntry {
                    username: "alice".to_string(),
                    password: "secret".to_string(),
                }],
            },
            &AclConfig {
                enabled: !acl_rules.is_empty(),
                rules: acl_rules,
            },
        )
    }

    #[tokio::test]
    async fn test_authenticate() {
        let p = provider(true, vec![]);

        assert!(p.authenticate("c", Some("alice"), Some(b"secret")).await);
        assert!(!p.authenticate("c", Some("alice"), Some(b"wrong")).await);
        assert!(!p.authenticate("c", Some("bob"), Some(b"secret")).await);
        assert!(!p.authenticate("c", None, None).await);
    }

    #[tokio::test]
    async fn test_auth_disabled_allows_all() {
        let p = provider(false, vec![]);
        assert!(p.authenticate("c", None, None).await);
    }

    #[tokio::test]
    async fn test_deny_rule_wins_first_match() {
        let p = provider(
            false,
            vec![
                rule("publish", Some("forbidden/#"), false),
                rule("*", None, true),
            ],
        );

        assert!(
            !p.check("c", None, Action::Publish, "forbidden/zone")
                .await
        );
        assert!(p.check("c", None, Action::Publish, "allowed/zone").await);
        // Subscribe is not covered by the deny rule
        assert!(
            p.check("c", None, Action::Subscribe, "forbidden/zone")
                .await
        );
    }

    #[tokio::test]
    async fn test_client_pattern_matching() {
        let mut deny = rule("*", None, false);
        deny.client_id_pattern = Some("evil-*".to_string());
        let p = provider(false, vec![deny]);

        assert!(!p.check("evil-7", None, Action::Connect, "").await);
        assert!(p.check("good-7", None, Action::Connect, "").await);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let mut low = rule("publish", Some("#"), false);
        low.priority = 0;
        let mut high = rule("publish", Some("public/#"), true);
        high.priority = 10;

        let p = provider(false, vec![low, high]);
        assert!(p.check("c", None, Action::Publish, "public/news").await);
        assert!(!p.check("c", None, Action::Publish, "private/x").await);
    }
}
