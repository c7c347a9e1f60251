//! The auth adapter seam: an injected capability the sync server calls to
//! authenticate a handshake and authorize individual actions.
//!
//! Grounded on the teacher's `enterprise::auth::{provider, rbac}` adapter
//! shape; the default implementation here mirrors the specification's
//! accept-all, grant-`editor` default rather than the teacher's RBAC engine,
//! since this crate treats authorization as an external collaborator (§1).

use async_trait::async_trait;

use super::Role;

/// The context passed to `authenticate`/`authorize`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The document being joined or written to.
    pub doc_id: String,
    /// The connecting client's id.
    pub client_id: String,
    /// An opaque bearer token, if the client supplied one.
    pub token: Option<String>,
    /// Free-form user metadata supplied at handshake.
    pub user_meta: Option<serde_json::Value>,
    /// The authenticated user id, once known (absent during `authenticate`).
    pub user_id: Option<String>,
    /// The granted role, once known (absent during `authenticate`).
    pub role: Option<Role>,
}

/// The outcome of `authenticate`.
#[derive(Debug, Clone)]
pub struct AuthenticateOutcome {
    /// Whether the connection is authenticated.
    pub authenticated: bool,
    /// The resolved user id, if authenticated.
    pub user_id: Option<String>,
    /// The granted role, if authenticated.
    pub role: Option<Role>,
    /// A sanitized reason, populated on denial.
    pub reason: Option<String>,
}

/// Injected authentication/authorization capability.
///
/// Any panic unwinding out of an implementation's `authenticate`/`authorize`
/// must be caught by the caller and treated as denial — this trait's
/// contract assumes callers wrap invocations in `catch_unwind` or an
/// equivalent boundary, the same way the teacher treats a thrown exception
/// from a pluggable `AuthProvider` as a denial rather than propagating it.
#[async_trait]
pub trait AuthAdapter: Send + Sync {
    /// Authenticate a connecting client.
    async fn authenticate(&self, context: &AuthContext) -> AuthenticateOutcome;

    /// Authorize an action (e.g. `"write"`) for an already-authenticated
    /// context.
    async fn authorize(&self, context: &AuthContext, action: &str) -> bool;
}

/// Accepts every connection and grants `editor` to everyone. The default
/// when no application-specific adapter is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAuthAdapter;

#[async_trait]
impl AuthAdapter for DefaultAuthAdapter {
    async fn authenticate(&self, context: &AuthContext) -> AuthenticateOutcome {
        AuthenticateOutcome {
            authenticated: true,
            user_id: Some(context.client_id.clone()),
            role: Some(Role::Editor),
            reason: None,
        }
    }

    async fn authorize(&self, _context: &AuthContext, _action: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AuthContext {
        AuthContext {
            doc_id: "doc-1".to_string(),
            client_id: "client-1".to_string(),
            token: None,
            user_meta: None,
            user_id: None,
            role: None,
        }
    }

    #[tokio::test]
    async fn default_adapter_authenticates_and_grants_editor() {
        let adapter = DefaultAuthAdapter;
        let outcome = adapter.authenticate(&context()).await;
        assert!(outcome.authenticated);
        assert_eq!(outcome.role, Some(Role::Editor));
    }

    #[tokio::test]
    async fn default_adapter_authorizes_everything() {
        let adapter = DefaultAuthAdapter;
        assert!(adapter.authorize(&context(), "write").await);
    }
}
