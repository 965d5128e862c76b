//! Per-request context: tenant identity and cancellation.
//!
//! The transport layer extracts the tenant from request metadata (the
//! `X-Scope-OrgID` header by convention) and populates the context before
//! calling into the ingester. All state is partitioned by tenant; a context
//! without one can only fail with a 401-class error.

use tokio_util::sync::CancellationToken;

/// Identity and cancellation signal carried through a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    tenant: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context with no tenant. Pushes and queries will be rejected.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token, e.g. with one derived from the
    /// transport's request deadline.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_accessor() {
        assert_eq!(RequestContext::anonymous().tenant(), None);
        assert_eq!(RequestContext::with_tenant("1").tenant(), Some("1"));
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        let ctx = RequestContext::with_tenant("1").with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
