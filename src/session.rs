//! Authenticated identity produced by the login handshake (§4.2).
//!
//! [`Session`] is deliberately dumb: it holds what the login RPCs
//! returned plus the merged call context, and exposes nothing beyond
//! accessors. All the handshake logic lives on [`crate::client::Client`],
//! which is the only thing that constructs a [`Session`].

use serde_json::{Map, Value};

/// RPC-wide parameters (locale, timezone, user-defined flags) merged
/// with three-way precedence: explicit per-call context overrides the
/// scope/call context, which overrides session defaults (§4.2).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallContext(Map<String, Value>);

impl CallContext {
    pub fn new() -> Self {
        CallContext(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        CallContext(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` on top of `self`; keys in `other` win. Used to
    /// layer session defaults < scope context < explicit call context.
    pub fn merged(&self, other: &CallContext) -> CallContext {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        CallContext(merged)
    }
}

impl From<Map<String, Value>> for CallContext {
    fn from(map: Map<String, Value>) -> Self {
        CallContext(map)
    }
}

/// Authenticated identity for a single logged-in user against a single
/// database. `authenticated` holds iff both `database` and `user_id`
/// are populated (§3's Session invariant).
#[derive(Debug, Clone)]
pub struct Session {
    pub database: String,
    pub user_id: i64,
    pub credential: String,
    pub server_version: Option<Value>,
    pub context: CallContext,
}

impl Session {
    pub fn new(database: impl Into<String>, user_id: i64, credential: impl Into<String>) -> Self {
        Session {
            database: database.into(),
            user_id,
            credential: credential.into(),
            server_version: None,
            context: CallContext::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.database.is_empty() && self.user_id != 0
    }

    pub fn with_server_version(mut self, version: Value) -> Self {
        self.server_version = Some(version);
        self
    }

    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_merge_precedence_favors_the_argument() {
        let defaults = CallContext::new().with("lang", "en_US").with("tz", "UTC");
        let call = CallContext::new().with("tz", "America/New_York");
        let merged = defaults.merged(&call);
        assert_eq!(merged.as_map().get("lang").unwrap(), "en_US");
        assert_eq!(merged.as_map().get("tz").unwrap(), "America/New_York");
    }

    #[test]
    fn session_authenticated_requires_database_and_uid() {
        let s = Session::new("demo", 7, "admin");
        assert!(s.is_authenticated());
        let anon = Session::new("", 0, "");
        assert!(!anon.is_authenticated());
    }
}
