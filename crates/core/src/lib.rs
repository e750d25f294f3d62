//! Tunnelboard core types: query keys, cache snapshots, mutations, errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Structural identifier for a cached resource query: a resource name plus
/// zero or more parameter segments. Two keys with the same segments address
/// the same cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    resource: String,
    params: SmallVec<[String; 3]>,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self { resource: resource.into(), params: SmallVec::new() }
    }

    pub fn with_params<I, S>(resource: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { resource: resource.into(), params: params.into_iter().map(Into::into).collect() }
    }

    pub fn push(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for p in &self.params {
            write!(f, "/{}", p)?;
        }
        Ok(())
    }
}

/// HTTP-like verbs understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed server response: status code plus the body as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Json,
}

/// Error taxonomy shared across transport, session guard, cache and mutations.
///
/// `AuthExpired` is only ever produced by the session guard (from an HTTP 401)
/// and is the one error with a mandatory side effect: credential teardown.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("network: {0}")]
    Network(String),
    #[error("http {status}")]
    Http { status: u16, body: Json },
    #[error("session expired")]
    AuthExpired,
    #[error("validation {status}")]
    Validation { status: u16, body: Json },
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Per-entry fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of a cache slot handed to readers. Owned exclusively by the
/// cache; readers get clones and never mutate shared state.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub value: Option<Json>,
    pub status: FetchStatus,
    /// Stamped on successful fetch completion (tokio clock, so paused-time
    /// tests see it advance).
    pub fetched_at: Option<Instant>,
    pub error: Option<ApiError>,
    pub subscriber_count: usize,
}

impl CacheEntry {
    pub fn idle(key: QueryKey) -> Self {
        Self { key, value: None, status: FetchStatus::Idle, fetched_at: None, error: None, subscriber_count: 0 }
    }

    /// Fresh within `stale_after` of the last successful fetch. A `None`
    /// policy means always stale.
    pub fn is_fresh(&self, stale_after: Option<Duration>) -> bool {
        match (self.fetched_at, stale_after) {
            (Some(t), Some(d)) => t.elapsed() <= d,
            _ => false,
        }
    }
}

/// Descriptor for one write operation: verb, target, payload and the query
/// keys to invalidate once the server confirms success.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Json>,
    pub invalidates: Vec<QueryKey>,
}

impl MutationRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: None, invalidates: Vec::new() }
    }

    pub fn body(mut self, body: Json) -> Self {
        self.body = Some(body);
        self
    }

    pub fn invalidates(mut self, key: QueryKey) -> Self {
        self.invalidates.push(key);
        self
    }
}

/// Lifecycle of one mutation call. Terminal in both end states; a new call
/// starts a fresh instance.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState {
    Idle,
    Pending,
    Succeeded(Response),
    Failed(ApiError),
}

/// Role carried by an authenticated session. Advisory on the client; the
/// backend enforces authorization on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    SuperAdmin,
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Console surfaces a role unlocks. Consumed by the UI layer to decide what
/// to render; never checked by the core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    ViewDashboard,
    ManageServers,
    ManagePlans,
    ManageUsers,
    ViewAnalytics,
    ViewHealth,
    ManageAdmins,
}

/// Pure mapping from session role to capability set.
pub fn capabilities(role: Option<Role>) -> SmallVec<[Capability; 8]> {
    use Capability::*;
    match role {
        None => SmallVec::new(),
        Some(Role::Admin) => {
            SmallVec::from_slice(&[ViewDashboard, ManageServers, ManagePlans, ManageUsers, ViewAnalytics, ViewHealth])
        }
        Some(Role::SuperAdmin) => SmallVec::from_slice(&[
            ViewDashboard,
            ManageServers,
            ManagePlans,
            ManageUsers,
            ViewAnalytics,
            ViewHealth,
            ManageAdmins,
        ]),
    }
}

pub mod prelude {
    pub use super::{
        capabilities, ApiError, ApiResult, CacheEntry, Capability, FetchStatus, Method, MutationRequest,
        MutationState, QueryKey, Response, Role,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keys_compare_structurally() {
        let a = QueryKey::with_params("users", ["list", "1"]);
        let b = QueryKey::new("users").push("list").push("1");
        assert_eq!(a, b);
        assert_ne!(a, QueryKey::with_params("users", ["list", "2"]));
    }

    #[test]
    fn query_key_display_joins_segments() {
        let k = QueryKey::with_params("analytics", ["usage"]);
        assert_eq!(k.to_string(), "analytics/usage");
        assert_eq!(QueryKey::new("servers").to_string(), "servers");
    }

    #[test]
    fn role_parses_snake_case() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("super_admin".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn capabilities_grow_with_role() {
        assert!(capabilities(None).is_empty());
        let admin = capabilities(Some(Role::Admin));
        let superadmin = capabilities(Some(Role::SuperAdmin));
        assert!(admin.contains(&Capability::ManageServers));
        assert!(!admin.contains(&Capability::ManageAdmins));
        assert!(superadmin.contains(&Capability::ManageAdmins));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_freshness_follows_policy() {
        let mut e = CacheEntry::idle(QueryKey::new("servers"));
        assert!(!e.is_fresh(Some(Duration::from_secs(60))));
        e.fetched_at = Some(Instant::now());
        assert!(e.is_fresh(Some(Duration::from_secs(60))));
        // No policy means always stale.
        assert!(!e.is_fresh(None));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!e.is_fresh(Some(Duration::from_secs(60))));
    }
}
