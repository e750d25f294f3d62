//! Tunnelboard session: credential lifecycle and the auth guard.
//!
//! `Session` owns the bearer credential and role; it is created by the
//! caller and shared by `Arc` into whatever needs it (no ambient lookup).
//! `SessionGuard` wraps a `Transport`, attaches the credential to every
//! outgoing request, and tears the session down exactly once when the
//! backend answers 401.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use metrics::counter;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnelboard_core::{capabilities, ApiError, ApiResult, Capability, Method, Response, Role};
use tunnelboard_transport::Transport;

/// Process-wide session state: `anonymous -> authenticated -> anonymous`.
///
/// The credential slot is lock-free; teardown uses an atomic take so two
/// racing 401s clear it once and signal `session ended` once.
pub struct Session {
    credential: ArcSwapOption<String>,
    role: ArcSwapOption<Role>,
    ended_tx: watch::Sender<u64>,
}

impl Session {
    pub fn new() -> Self {
        let (ended_tx, _) = watch::channel(0u64);
        Self { credential: ArcSwapOption::empty(), role: ArcSwapOption::empty(), ended_tx }
    }

    pub fn login(&self, credential: impl Into<String>, role: Option<Role>) {
        self.credential.store(Some(Arc::new(credential.into())));
        self.role.store(role.map(Arc::new));
        info!(role = ?role, "session: authenticated");
    }

    /// Explicit logout. Clears state without emitting `session ended`; that
    /// signal is reserved for authorization failures.
    pub fn logout(&self) {
        self.credential.store(None);
        self.role.store(None);
        info!("session: logged out");
    }

    pub fn credential(&self) -> Option<Arc<String>> {
        self.credential.load_full()
    }

    pub fn role(&self) -> Option<Role> {
        self.role.load_full().map(|r| *r)
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.load().is_some()
    }

    pub fn capabilities(&self) -> SmallVec<[Capability; 8]> {
        capabilities(self.role())
    }

    /// Watch channel that bumps a generation counter each time the session
    /// is torn down by an authorization failure. The UI layer awaits
    /// `changed()` on the receiver to redirect to its login surface.
    pub fn on_session_ended(&self) -> watch::Receiver<u64> {
        self.ended_tx.subscribe()
    }

    /// Teardown after an authorization failure. Idempotent: only the call
    /// that actually takes the credential bumps the generation.
    pub fn expire(&self) {
        if self.credential.swap(None).is_some() {
            self.role.store(None);
            self.ended_tx.send_modify(|g| *g += 1);
            counter!("session_expired", 1u64);
            warn!("session: ended by authorization failure");
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport wrapper mediating credential attachment and 401 teardown.
///
/// Implements `Transport` itself, so the cache and mutation pipeline can
/// take it as their transport and never touch the session directly. It
/// never retries; retry policy belongs to the caller.
pub struct SessionGuard {
    inner: Arc<dyn Transport>,
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn new(inner: Arc<dyn Transport>, session: Arc<Session>) -> Self {
        Self { inner, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[async_trait::async_trait]
impl Transport for SessionGuard {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Json>,
        _bearer: Option<&str>,
    ) -> ApiResult<Response> {
        // The guard owns the credential; any caller-supplied bearer is ignored.
        let cred = self.session.credential();
        let req_id = Uuid::new_v4();
        debug!(req = %req_id, method = %method, path = %path, authed = cred.is_some(), "guard: send");
        let res = self.inner.send(method, path, body, cred.as_deref().map(String::as_str)).await;
        match res {
            Err(ApiError::Http { status: 401, body: _ }) => {
                self.session.expire();
                counter!("guard_auth_expired", 1u64);
                warn!(req = %req_id, path = %path, "guard: 401, session torn down");
                Err(ApiError::AuthExpired)
            }
            Err(ApiError::Http { status, body }) if (400..500).contains(&status) => {
                debug!(req = %req_id, status, "guard: validation error");
                Err(ApiError::Validation { status, body })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tunnelboard_transport::MockTransport;

    fn guarded(mock: Arc<MockTransport>) -> (SessionGuard, Arc<Session>) {
        let session = Arc::new(Session::new());
        (SessionGuard::new(mock, session.clone()), session)
    }

    #[tokio::test]
    async fn attaches_bearer_when_authenticated() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_ok(Method::Get, "/api/v1/vpn/servers", json!([]));
        let (guard, session) = guarded(mock.clone());

        guard.send(Method::Get, "/api/v1/vpn/servers", None, None).await.unwrap();
        session.login("tok-1", Some(Role::Admin));
        guard.send(Method::Get, "/api/v1/vpn/servers", None, None).await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].bearer, None);
        assert_eq!(calls[1].bearer.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn unauthorized_clears_credential_and_maps_error() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(Method::Get, "/api/v1/users/", Err(ApiError::Http { status: 401, body: Json::Null }));
        let (guard, session) = guarded(mock);
        session.login("tok", Some(Role::Admin));

        let err = guard.send(Method::Get, "/api/v1/users/", None, None).await.unwrap_err();
        assert_eq!(err, ApiError::AuthExpired);
        assert!(session.credential().is_none());
        assert!(session.role().is_none());
    }

    #[tokio::test]
    async fn double_unauthorized_signals_session_ended_once() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(Method::Get, "/x", Err(ApiError::Http { status: 401, body: Json::Null }));
        let (guard, session) = guarded(mock);
        let rx = session.on_session_ended();
        session.login("tok", None);

        let _ = guard.send(Method::Get, "/x", None, None).await;
        let _ = guard.send(Method::Get, "/x", None, None).await;

        assert_eq!(*rx.borrow(), 1);
        assert!(session.credential().is_none());
    }

    #[tokio::test]
    async fn other_4xx_becomes_validation_and_keeps_session() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::Post,
            "/api/v1/vpn/servers",
            Err(ApiError::Http { status: 422, body: json!({"detail": "bad ip"}) }),
        );
        let (guard, session) = guarded(mock);
        session.login("tok", Some(Role::Admin));

        let err = guard.send(Method::Post, "/api/v1/vpn/servers", None, None).await.unwrap_err();
        assert_eq!(err, ApiError::Validation { status: 422, body: json!({"detail": "bad ip"}) });
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn server_errors_pass_through_untouched() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(Method::Get, "/x", Err(ApiError::Http { status: 500, body: json!("boom") }));
        let (guard, session) = guarded(mock);
        session.login("tok", None);

        let err = guard.send(Method::Get, "/x", None, None).await.unwrap_err();
        assert_eq!(err, ApiError::Http { status: 500, body: json!("boom") });
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn logout_does_not_signal_session_ended() {
        let session = Session::new();
        let rx = session.on_session_ended();
        session.login("tok", Some(Role::SuperAdmin));
        assert!(session.capabilities().contains(&Capability::ManageAdmins));
        session.logout();
        assert_eq!(*rx.borrow(), 0);
        assert!(!session.is_authenticated());
        assert!(session.capabilities().is_empty());
    }

    #[tokio::test]
    async fn expire_on_anonymous_session_is_noop() {
        let session = Session::new();
        let rx = session.on_session_ended();
        session.expire();
        session.expire();
        assert_eq!(*rx.borrow(), 0);
    }
}
