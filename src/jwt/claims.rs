//! Dynamic JWT claim maps.
//!
//! Providers put arbitrary data in their tokens, so verified payloads are kept
//! as a map from claim name to [`ClaimValue`]. Accessors return `None` when a
//! claim is absent or has a different shape; they never fail.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A single claim value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    /// JSON boolean
    Bool(bool),
    /// JSON number
    Number(serde_json::Number),
    /// JSON string
    String(String),
    /// JSON array
    List(Vec<ClaimValue>),
    /// Nested JSON object
    Object(BTreeMap<String, ClaimValue>),
    /// JSON null
    Null,
}

impl ClaimValue {
    /// String content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if this is a number representable as `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Elements, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[ClaimValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Nested claim, if this is an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ClaimValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// String elements of a list; non-string elements are skipped.
    fn string_items(&self) -> impl Iterator<Item = &str> {
        self.as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(ClaimValue::as_str)
    }
}

impl From<serde_json::Value> for ClaimValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Verified token payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims {
    map: BTreeMap<String, ClaimValue>,
}

impl Claims {
    /// Raw claim lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.map.get(name)
    }

    /// String claim lookup.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ClaimValue::as_str)
    }

    /// Boolean claim lookup.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ClaimValue::as_bool)
    }

    /// Integer claim lookup.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ClaimValue::as_i64)
    }

    /// `sub`
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.get_str("sub")
    }

    /// `exp` as Unix seconds.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.get_i64("exp")
    }

    /// `typ`, as set by Keycloak-style providers (`Bearer`, `Refresh`, `ID`).
    #[must_use]
    pub fn token_type(&self) -> Option<&str> {
        self.get_str("typ")
    }

    /// Space separated `scope` claim, empty when absent.
    #[must_use]
    pub fn scope(&self) -> &str {
        self.get_str("scope").unwrap_or_default()
    }

    /// Individual scopes.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope().split_whitespace()
    }

    /// Role set gathered from `roles`, `realm_access.roles` and every
    /// `resource_access.<client>.roles` list.
    #[must_use]
    pub fn roles(&self) -> BTreeSet<String> {
        let mut roles: BTreeSet<String> = BTreeSet::new();

        if let Some(top) = self.get("roles") {
            roles.extend(top.string_items().map(str::to_string));
        }

        if let Some(realm) = self.get("realm_access").and_then(|r| r.get("roles")) {
            roles.extend(realm.string_items().map(str::to_string));
        }

        if let Some(ClaimValue::Object(clients)) = self.get("resource_access") {
            for client in clients.values() {
                if let Some(list) = client.get("roles") {
                    roles.extend(list.string_items().map(str::to_string));
                }
            }
        }

        roles
    }

    /// Identity used for the `X-User` header: the first string claim in
    /// `names` (defaulting to `email`, `preferred_username`, `name`).
    ///
    /// With `email_verify_check` set, `email` is skipped unless
    /// `email_verified` is `true`.
    #[must_use]
    pub fn x_user(&self, names: &[String], email_verify_check: bool) -> Option<&str> {
        const DEFAULT_NAMES: [&str; 3] = ["email", "preferred_username", "name"];

        if names.is_empty() {
            self.first_user_claim(DEFAULT_NAMES, email_verify_check)
        } else {
            self.first_user_claim(names.iter().map(String::as_str), email_verify_check)
        }
    }

    fn first_user_claim<'n>(
        &self,
        names: impl IntoIterator<Item = &'n str>,
        email_verify_check: bool,
    ) -> Option<&str> {
        names.into_iter().find_map(|name| {
            let value = self.get_str(name)?;
            if name == "email" && email_verify_check && self.get_bool("email_verified") != Some(true) {
                return None;
            }
            Some(value)
        })
    }

    /// Display alias for internally issued codes: `preferred_username`,
    /// then `email`, then `name`.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        ["preferred_username", "email", "name"]
            .into_iter()
            .find_map(|name| self.get_str(name).filter(|v| !v.is_empty()))
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// `true` when no claims are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Claims {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            map: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: serde_json::Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn accessors_return_none_for_absent_or_mistyped_claims() {
        // GIVEN: a payload with a numeric `email`
        let c = claims(json!({"sub": "u1", "email": 42}));

        // THEN: typed lookups degrade to None instead of failing
        assert_eq!(c.subject(), Some("u1"));
        assert_eq!(c.get_str("email"), None);
        assert_eq!(c.get_bool("missing"), None);
        assert_eq!(c.scope(), "");
    }

    #[test]
    fn roles_are_collected_from_all_known_locations() {
        let c = claims(json!({
            "roles": ["admin"],
            "realm_access": {"roles": ["offline_access", "admin"]},
            "resource_access": {
                "api": {"roles": ["reader"]},
                "web": {"roles": ["writer", 7]}
            }
        }));

        let roles: Vec<String> = c.roles().into_iter().collect();
        assert_eq!(roles, vec!["admin", "offline_access", "reader", "writer"]);
    }

    #[test]
    fn x_user_uses_default_precedence() {
        let c = claims(json!({"preferred_username": "alice", "name": "Alice A"}));
        assert_eq!(c.x_user(&[], false), Some("alice"));
    }

    #[test]
    fn x_user_skips_unverified_email_when_check_enabled() {
        // GIVEN: an email that is explicitly not verified
        let c = claims(json!({
            "email": "alice@example.com",
            "email_verified": false,
            "preferred_username": "alice"
        }));

        // THEN: the check moves on to the next configured claim
        assert_eq!(c.x_user(&[], true), Some("alice"));
        assert_eq!(c.x_user(&[], false), Some("alice@example.com"));
    }

    #[test]
    fn x_user_honours_configured_claim_names() {
        let c = claims(json!({"email": "a@example.com", "upn": "a@corp"}));
        let names = vec!["upn".to_string(), "email".to_string()];
        assert_eq!(c.x_user(&names, false), Some("a@corp"));
    }

    #[test]
    fn alias_prefers_username_over_email() {
        let c = claims(json!({"email": "a@example.com", "preferred_username": ""}));
        assert_eq!(c.alias(), Some("a@example.com"));
    }

    #[test]
    fn scopes_split_on_whitespace() {
        let c = claims(json!({"scope": "openid  profile email"}));
        assert_eq!(c.scopes().collect::<Vec<_>>(), vec!["openid", "profile", "email"]);
    }
}
