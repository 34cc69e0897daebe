//! De-duplication of interactive redirects

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{AcquireError, Scopes, TokenProvider};

/// A latch allowing at most one interactive redirect in flight
///
/// All clones share the same flag, so a single guard created at start-up
/// and handed to every flow that may redirect (background refresh, HTTP
/// middleware, UI actions) guarantees that only one of them navigates away.
#[derive(Clone, Debug, Default)]
pub struct RedirectGuard {
    redirecting: Arc<AtomicBool>,
}

/// The result of a guarded redirect
#[derive(Debug)]
pub enum RedirectAttempt {
    /// This caller started the redirect
    Issued,
    /// Another caller already started a redirect; nothing was done
    AlreadyInProgress,
    /// The redirect could not be started; the guard was released
    Failed(AcquireError),
}

impl RedirectGuard {
    /// Constructs a guard with no redirect in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard
    ///
    /// Returns `true` if the guard was free and is now held by the caller.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.redirecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Frees the guard
    ///
    /// Called once a redirect response has been processed or an attempt is abandoned.
    pub fn release(&self) {
        self.redirecting.store(false, Ordering::Release);
    }

    /// Whether a redirect is currently in flight
    pub fn is_engaged(&self) -> bool {
        self.redirecting.load(Ordering::Acquire)
    }

    /// Starts an interactive redirect unless one is already in flight
    ///
    /// The guard stays engaged only once the redirect has been issued. If
    /// the returned future is dropped before that, the guard is released.
    pub async fn redirect_to_login(
        &self,
        provider: &TokenProvider,
        scopes: &Scopes,
    ) -> RedirectAttempt {
        if !self.try_acquire() {
            tracing::debug!("redirect already in progress, skipping");
            return RedirectAttempt::AlreadyInProgress;
        }
        let claim = Claim { guard: Some(self) };

        tracing::info!(scopes = %scopes, "interaction required, redirecting to login");
        match provider.login_interactive(Some(scopes)).await {
            Ok(()) => {
                claim.keep();
                RedirectAttempt::Issued
            }
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "unable to start login redirect"
                );
                RedirectAttempt::Failed(error)
            }
        }
    }
}

/// A held guard that is released on drop unless kept
struct Claim<'a> {
    guard: Option<&'a RedirectGuard>,
}

impl Claim<'_> {
    fn keep(mut self) {
        self.guard = None;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::{InMemoryIdentityProvider, ProviderError};

    #[test]
    fn only_the_first_acquire_succeeds() {
        let guard = RedirectGuard::new();
        let other = guard.clone();

        assert!(guard.try_acquire());
        assert!(!other.try_acquire());
        assert!(other.is_engaged());

        guard.release();
        assert!(!guard.is_engaged());
        assert!(other.try_acquire());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_issue_a_single_redirect() {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        let provider = TokenProvider::new(identity.clone());
        let guard = RedirectGuard::new();
        let scopes = Scopes::openid_defaults();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provider = provider.clone();
                let guard = guard.clone();
                let scopes = scopes.clone();
                tokio::spawn(async move { guard.redirect_to_login(&provider, &scopes).await })
            })
            .collect();

        let mut issued = 0;
        for task in tasks {
            if let RedirectAttempt::Issued = task.await.unwrap() {
                issued += 1;
            }
        }

        assert_eq!(issued, 1);
        assert_eq!(identity.redirect_requests().len(), 1);
        assert!(guard.is_engaged());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_redirect_releases_the_guard() {
        let identity = Arc::new(InMemoryIdentityProvider::new().with_stalled_redirects());
        let provider = TokenProvider::new(identity.clone());
        let guard = RedirectGuard::new();
        let scopes = Scopes::openid_defaults();

        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            guard.redirect_to_login(&provider, &scopes),
        )
        .await;

        assert!(attempt.is_err());
        assert_eq!(identity.redirect_requests().len(), 1);
        assert!(!guard.is_engaged());
    }

    #[tokio::test]
    async fn failed_redirect_releases_the_guard() {
        let identity = Arc::new(InMemoryIdentityProvider::new());
        identity.fail_next_redirect(ProviderError::Transient("navigation blocked".into()));
        let provider = TokenProvider::new(identity.clone());
        let guard = RedirectGuard::new();
        let scopes = Scopes::openid_defaults();

        let first = guard.redirect_to_login(&provider, &scopes).await;
        assert!(matches!(first, RedirectAttempt::Failed(_)));
        assert!(!guard.is_engaged());

        let second = guard.redirect_to_login(&provider, &scopes).await;
        assert!(matches!(second, RedirectAttempt::Issued));
        assert_eq!(identity.redirect_requests().len(), 2);
    }
}
