//! Tunnelboard console facade.
//!
//! Wires transport -> session guard -> cache/mutations and exposes the
//! page-level operations the UI consumes: one `watch_*` per console page,
//! mutation helpers carrying their invalidation sets, and the auth calls.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as Json};
use smallvec::SmallVec;
use tracing::info;

use tunnelboard_cache::{CacheConfig, Fetcher, Mutations, QueryCache, QueryOptions, Subscription};
use tunnelboard_core::{
    ApiError, ApiResult, CacheEntry, Capability, Method, MutationRequest, QueryKey, Response, Role,
};
use tunnelboard_session::{Session, SessionGuard};
use tunnelboard_transport::{HttpTransport, Transport};

pub mod models;

pub use tunnelboard_cache::MutationHandle;

/// Query-key catalog for the console pages. One key per page/table; the
/// mutation helpers below reference the same constructors so invalidation
/// always hits the slot the page is watching.
pub mod keys {
    use tunnelboard_core::QueryKey;

    pub fn servers() -> QueryKey {
        QueryKey::new("servers")
    }

    pub fn plans() -> QueryKey {
        QueryKey::new("plans")
    }

    pub fn users() -> QueryKey {
        QueryKey::with_params("users", ["list"])
    }

    pub fn vpn_users() -> QueryKey {
        QueryKey::with_params("vpn-users", ["list"])
    }

    pub fn admin_users() -> QueryKey {
        QueryKey::new("admin-users")
    }

    pub fn analytics_usage() -> QueryKey {
        QueryKey::with_params("analytics", ["usage"])
    }

    pub fn analytics_performance() -> QueryKey {
        QueryKey::with_params("analytics", ["performance"])
    }

    pub fn health(service: &str) -> QueryKey {
        QueryKey::with_params("health", [service])
    }
}

mod paths {
    pub const LOGIN: &str = "/api/v1/auth/login";
    pub const SERVERS: &str = "/api/v1/vpn/servers";
    pub const PLANS: &str = "/api/v1/admin/subscriptions/plans";
    pub const USERS: &str = "/api/v1/users/?skip=0&limit=100";
    pub const VPN_USERS: &str = "/api/v1/admin/vpn-users";
    pub const ADMIN_USERS: &str = "/api/v1/admin/admin-users";
    pub const CREATE_ADMIN: &str = "/api/v1/admin/create-admin-user";
    pub const USAGE: &str = "/api/v1/analytics/usage";
    pub const PERFORMANCE: &str = "/api/v1/analytics/performance";
}

/// Default poll cadence for the health page.
pub const HEALTH_POLL: Duration = Duration::from_secs(30);

/// Session-aware synchronized view onto the backend, shared by every page.
pub struct Console {
    session: Arc<Session>,
    guard: Arc<SessionGuard>,
    cache: QueryCache,
    mutations: Mutations,
}

impl Console {
    /// Production wiring: reqwest transport under the session guard.
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let transport = Arc::new(HttpTransport::new(base_url)?);
        info!(base = %base_url, "console: connecting");
        Ok(Self::with_transport(transport, CacheConfig::from_env()))
    }

    /// Wire an arbitrary transport (tests inject a mock here). The guard is
    /// always in place, so auth semantics hold regardless of transport.
    pub fn with_transport(transport: Arc<dyn Transport>, cfg: CacheConfig) -> Self {
        let session = Arc::new(Session::new());
        let guard = Arc::new(SessionGuard::new(transport, session.clone()));
        let cache = QueryCache::new(cfg);
        let mutations = Mutations::new(guard.clone() as Arc<dyn Transport>, cache.clone());
        Self { session, guard, cache, mutations }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub fn capabilities(&self) -> SmallVec<[Capability; 8]> {
        self.session.capabilities()
    }

    // ---- auth ----

    /// Authenticate and store the bearer token (and role, when the backend
    /// reports one) in the session.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Option<Role>> {
        let body = json!({ "email": email, "password": password });
        let resp = self.guard.send(Method::Post, paths::LOGIN, Some(&body), None).await?;
        let token = resp
            .body
            .get("access_token")
            .and_then(Json::as_str)
            .ok_or_else(|| ApiError::Internal("login response missing access_token".into()))?;
        let role = resp
            .body
            .get("role")
            .and_then(Json::as_str)
            .and_then(|s| s.parse::<Role>().ok());
        self.session.login(token, role);
        Ok(role)
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    pub fn on_session_ended(&self) -> tokio::sync::watch::Receiver<u64> {
        self.session.on_session_ended()
    }

    // ---- reads, one per console page ----

    pub fn watch_servers(&self) -> Subscription {
        self.watch(keys::servers(), paths::SERVERS)
    }

    pub fn watch_plans(&self) -> Subscription {
        self.watch(keys::plans(), paths::PLANS)
    }

    pub fn watch_users(&self) -> Subscription {
        self.watch(keys::users(), paths::USERS)
    }

    pub fn watch_vpn_users(&self) -> Subscription {
        self.watch(keys::vpn_users(), paths::VPN_USERS)
    }

    pub fn watch_admin_users(&self) -> Subscription {
        self.watch(keys::admin_users(), paths::ADMIN_USERS)
    }

    pub fn watch_usage(&self) -> Subscription {
        self.watch(keys::analytics_usage(), paths::USAGE)
    }

    pub fn watch_performance(&self) -> Subscription {
        self.watch(keys::analytics_performance(), paths::PERFORMANCE)
    }

    /// Health is the polling page: the subscription refetches on a timer
    /// for as long as it is held.
    pub fn watch_health(&self, service: &str, every: Duration) -> Subscription {
        let opts = QueryOptions { refetch_interval: Some(every), ..Default::default() };
        self.cache.subscribe(
            keys::health(service),
            self.fetcher(&format!("/api/v1/health/{}", service)),
            opts,
        )
    }

    // ---- writes, carrying their invalidation sets ----

    pub async fn create_server(&self, spec: &models::ServerSpec) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Post, paths::SERVERS)
                    .body(to_body(spec)?)
                    .invalidates(keys::servers()),
            )
            .await
    }

    pub async fn update_server(&self, id: &str, spec: &models::ServerSpec) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Put, format!("{}/{}", paths::SERVERS, id))
                    .body(to_body(spec)?)
                    .invalidates(keys::servers()),
            )
            .await
    }

    pub async fn delete_server(&self, id: &str) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Delete, format!("{}/{}", paths::SERVERS, id))
                    .invalidates(keys::servers()),
            )
            .await
    }

    pub async fn create_plan(&self, spec: &models::PlanSpec) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Post, paths::PLANS)
                    .body(to_body(spec)?)
                    .invalidates(keys::plans()),
            )
            .await
    }

    pub async fn update_plan(&self, id: &str, spec: &models::PlanSpec) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Put, format!("{}/{}", paths::PLANS, id))
                    .body(to_body(spec)?)
                    .invalidates(keys::plans()),
            )
            .await
    }

    pub async fn delete_plan(&self, id: &str) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Delete, format!("{}/{}", paths::PLANS, id))
                    .invalidates(keys::plans()),
            )
            .await
    }

    pub async fn set_user_active(&self, id: &str, is_active: bool) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Patch, format!("/api/v1/users/{}/status", id))
                    .body(json!({ "is_active": is_active }))
                    .invalidates(keys::users()),
            )
            .await
    }

    pub async fn set_vpn_user_active(&self, user_id: &str, is_active: bool) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(
                    Method::Put,
                    format!("/api/v1/admin/vpn-user/{}/status?is_active={}", user_id, is_active),
                )
                .invalidates(keys::vpn_users()),
            )
            .await
    }

    pub async fn create_admin_user(&self, spec: &models::AdminUserSpec) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Post, paths::CREATE_ADMIN)
                    .body(to_body(spec)?)
                    .invalidates(keys::admin_users()),
            )
            .await
    }

    pub async fn delete_admin_user(&self, id: &str) -> ApiResult<Response> {
        self.mutations
            .execute(
                MutationRequest::new(Method::Delete, format!("{}/{}", paths::ADMIN_USERS, id))
                    .invalidates(keys::admin_users()),
            )
            .await
    }

    // ---- plumbing ----

    fn watch(&self, key: QueryKey, path: &str) -> Subscription {
        self.cache.subscribe(key, self.fetcher(path), QueryOptions::default())
    }

    fn fetcher(&self, path: &str) -> Fetcher {
        let guard: Arc<dyn Transport> = self.guard.clone();
        let path = path.to_string();
        Arc::new(move || -> BoxFuture<'static, ApiResult<Json>> {
            let guard = guard.clone();
            let path = path.clone();
            Box::pin(async move { guard.send(Method::Get, &path, None, None).await.map(|r| r.body) })
        })
    }
}

fn to_body<T: Serialize>(spec: &T) -> ApiResult<Json> {
    serde_json::to_value(spec).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Decode a cache snapshot into a typed page model.
pub fn decode<T: DeserializeOwned>(entry: &CacheEntry) -> ApiResult<T> {
    let value = entry
        .value
        .as_ref()
        .ok_or_else(|| ApiError::Internal(format!("no value cached for {}", entry.key)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ApiError::Internal(format!("decoding {}: {}", entry.key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{ServerSpec, ServerStatus, VpnServer};
    use tunnelboard_core::FetchStatus;
    use tunnelboard_transport::MockTransport;

    fn console_with(mock: &Arc<MockTransport>) -> Console {
        let stale = CacheConfig { stale_after: Some(Duration::from_secs(600)), ..Default::default() };
        Console::with_transport(mock.clone(), stale)
    }

    fn server_json() -> Json {
        json!([{
            "id": "s1",
            "name": "fra-1",
            "ip_address": "10.0.0.1",
            "country": "DE",
            "city": "Frankfurt",
            "is_premium": false,
            "status": "active",
            "max_connections": 500,
            "current_connections": 12
        }])
    }

    #[tokio::test(start_paused = true)]
    async fn servers_page_loads_and_refetches_after_mutation() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(Method::Get, paths::SERVERS, server_json());
        mock.respond_ok(Method::Post, paths::SERVERS, json!({"id": "s2"}));
        let console = console_with(&mock);

        let mut sub = console.watch_servers();
        assert_eq!(sub.current().status, FetchStatus::Loading);
        let entry = sub.ready().await;
        assert_eq!(entry.status, FetchStatus::Success);
        let servers: Vec<VpnServer> = decode(&entry).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].status, ServerStatus::Active);

        let spec = ServerSpec {
            name: "ams-1".into(),
            ip_address: "10.0.0.2".into(),
            country: "NL".into(),
            city: "Amsterdam".into(),
            is_premium: true,
            status: ServerStatus::Active,
            max_connections: 300,
        };
        console.create_server(&spec).await.unwrap();
        sub.ready().await;
        assert_eq!(mock.call_count(Method::Get, paths::SERVERS), 2, "exactly one refetch");
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_fetch_ends_session_and_marks_entry() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::Get,
            paths::SERVERS,
            Err(ApiError::Http { status: 401, body: Json::Null }),
        );
        let console = console_with(&mock);
        console.session().login("tok", Some(Role::Admin));
        let ended = console.on_session_ended();

        let mut sub = console.watch_servers();
        let entry = sub.ready().await;
        assert_eq!(entry.status, FetchStatus::Error);
        assert_eq!(entry.error, Some(ApiError::AuthExpired));
        assert!(console.session().credential().is_none());
        assert_eq!(*ended.borrow(), 1, "session ended fired once");
    }

    #[tokio::test(start_paused = true)]
    async fn login_stores_token_and_role() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(
            Method::Post,
            paths::LOGIN,
            json!({ "access_token": "tok-9", "role": "super_admin" }),
        );
        let console = console_with(&mock);

        let role = console.login("root@example.com", "hunter2").await.unwrap();
        assert_eq!(role, Some(Role::SuperAdmin));
        assert_eq!(console.session().credential().unwrap().as_str(), "tok-9");
        assert!(console.capabilities().contains(&Capability::ManageAdmins));

        // Login itself goes out unauthenticated.
        assert_eq!(mock.calls()[0].bearer, None);
    }

    #[tokio::test(start_paused = true)]
    async fn login_without_token_is_an_error() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(Method::Post, paths::LOGIN, json!({ "detail": "ok but no token" }));
        let console = console_with(&mock);
        let err = console.login("a@b.c", "pw").await.unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
        assert!(!console.session().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_mutation_leaves_page_untouched() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(Method::Get, paths::PLANS, json!([]));
        mock.respond(
            Method::Delete,
            "/api/v1/admin/subscriptions/plans/p1",
            Err(ApiError::Http { status: 422, body: json!({"detail": "plan in use"}) }),
        );
        let console = console_with(&mock);

        let mut sub = console.watch_plans();
        sub.ready().await;
        let err = console.delete_plan("p1").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation { status: 422, .. }));
        tokio::task::yield_now().await;
        assert_eq!(mock.call_count(Method::Get, paths::PLANS), 1, "no invalidation on failure");
    }

    #[tokio::test(start_paused = true)]
    async fn health_page_polls_on_interval() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(
            Method::Get,
            "/api/v1/health/db",
            json!({ "service": "db", "status": "healthy", "last_check": "now" }),
        );
        let console = console_with(&mock);

        let mut sub = console.watch_health("db", Duration::from_secs(30));
        sub.ready().await;
        assert_eq!(mock.call_count(Method::Get, "/api/v1/health/db"), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        sub.ready().await;
        assert_eq!(mock.call_count(Method::Get, "/api/v1/health/db"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_reports_missing_and_mismatched_values() {
        let entry = CacheEntry::idle(keys::servers());
        assert!(decode::<Vec<VpnServer>>(&entry).is_err());

        let mut entry = CacheEntry::idle(keys::servers());
        entry.value = Some(json!({"not": "a list"}));
        assert!(decode::<Vec<VpnServer>>(&entry).is_err());
    }
}
