//! Token acquisition on top of an [`IdentityProvider`]

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    provider::{
        Account, AuthenticationResult, IdentityProvider, Prompt, ProviderError, RedirectRequest,
    },
    ClaimsSet, LoginHint, Scopes, TokenResult,
};

/// An error while acquiring a token
#[derive(Clone, Debug, Error)]
pub enum AcquireError {
    /// The user must sign in again, consent, or pick an account
    #[error("user interaction required ({code})")]
    InteractionRequired {
        /// The provider's error code
        code: String,
    },
    /// A network or server hiccup; a later attempt may succeed
    #[error("token acquisition failed transiently")]
    Transient(#[source] ProviderError),
    /// The provider is misconfigured or responded with something unusable
    #[error("identity provider protocol error")]
    Protocol(#[source] ProviderError),
    /// The provider answered without a required part of the token
    #[error("token response is missing the {0}")]
    IncompleteResponse(&'static str),
}

impl AcquireError {
    /// Whether the user must interact with the provider to proceed
    pub fn is_interaction_required(&self) -> bool {
        matches!(self, Self::InteractionRequired { .. })
    }
}

impl From<ProviderError> for AcquireError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::InteractionRequired { code } => Self::InteractionRequired { code },
            ProviderError::Transient(_) => Self::Transient(error),
            ProviderError::Protocol(_) => Self::Protocol(error),
        }
    }
}

/// The result of processing a redirect response
#[derive(Clone, Debug, PartialEq)]
pub enum RedirectOutcome {
    /// A redirect sign-in completed during this load
    Completed {
        /// The account that signed in
        account: Account,
        /// Claims of the identity token returned with the redirect
        claims: Option<ClaimsSet>,
    },
    /// No redirect completed, but exactly one cached account was found
    Restored(Account),
    /// No session could be established
    NoSession,
    /// The redirect response was already processed during this load
    AlreadyProcessed,
}

impl RedirectOutcome {
    /// The account resolved by the redirect processing, if any
    pub fn account(&self) -> Option<&Account> {
        match self {
            Self::Completed { account, .. } | Self::Restored(account) => Some(account),
            Self::NoSession | Self::AlreadyProcessed => None,
        }
    }
}

/// Acquires tokens through an identity provider
///
/// Cloning is cheap; all clones share the same provider, initialization
/// latch and redirect-processing latch.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    initialized: OnceCell<()>,
    redirect_processed: AtomicBool,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("initialized", &self.inner.initialized.initialized())
            .field(
                "redirect_processed",
                &self.inner.redirect_processed.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// Wraps an identity provider
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                initialized: OnceCell::new(),
                redirect_processed: AtomicBool::new(false),
            }),
        }
    }

    /// Initializes the underlying provider
    ///
    /// Runs at most once successfully; every other operation awaits this first.
    pub async fn initialize(&self) -> Result<(), ProviderError> {
        self.inner
            .initialized
            .get_or_try_init(|| async {
                tracing::debug!("initializing identity provider");
                self.inner.identity.initialize().await
            })
            .await
            .map(|_| ())
    }

    /// Processes the response of a completed redirect
    ///
    /// Only the first call in the lifetime of this provider that gets past
    /// initialization touches the identity provider; later calls return
    /// [`RedirectOutcome::AlreadyProcessed`]. If initialization fails, the
    /// response stays pending for the next call. The resolved account becomes
    /// the active account.
    pub async fn process_redirect_result(&self) -> Result<RedirectOutcome, ProviderError> {
        self.initialize().await?;

        if self.inner.redirect_processed.swap(true, Ordering::AcqRel) {
            tracing::trace!("redirect response already processed");
            return Ok(RedirectOutcome::AlreadyProcessed);
        }

        let identity = &self.inner.identity;
        let outcome = match identity.handle_redirect_response().await? {
            Some(response) => {
                let account = response
                    .account
                    .or_else(|| identity.cached_accounts().into_iter().next());
                match account {
                    Some(account) => RedirectOutcome::Completed {
                        account,
                        claims: response.id_token_claims,
                    },
                    None => {
                        tracing::warn!("redirect response carried no account");
                        RedirectOutcome::NoSession
                    }
                }
            }
            None => {
                let mut accounts = identity.cached_accounts();
                if accounts.len() == 1 {
                    RedirectOutcome::Restored(accounts.remove(0))
                } else {
                    tracing::debug!(
                        cached_accounts = accounts.len(),
                        "no redirect response and no unambiguous cached account"
                    );
                    RedirectOutcome::NoSession
                }
            }
        };

        if let Some(account) = outcome.account() {
            identity.set_active_account(Some(account.clone()));
        }

        Ok(outcome)
    }

    /// All accounts with a cached session
    pub fn accounts(&self) -> Vec<Account> {
        self.inner.identity.cached_accounts()
    }

    /// The active account, falling back to the first cached account
    pub fn active_account(&self) -> Option<Account> {
        self.inner
            .identity
            .active_account()
            .or_else(|| self.accounts().into_iter().next())
    }

    /// Sets or clears the active account
    pub fn set_active_account(&self, account: Option<Account>) {
        self.inner.identity.set_active_account(account);
    }

    /// Acquires a token without user interaction for the active account
    ///
    /// Fails with [`AcquireError::InteractionRequired`] when there is no
    /// account to renew a token for.
    pub async fn acquire_silently(&self, scopes: &Scopes) -> Result<TokenResult, AcquireError> {
        self.initialize().await?;

        let account = self
            .active_account()
            .ok_or_else(|| AcquireError::InteractionRequired {
                code: "no_account".to_owned(),
            })?;

        self.acquire_silently_for(scopes, &account).await
    }

    /// Acquires a token without user interaction for a specific account
    pub async fn acquire_silently_for(
        &self,
        scopes: &Scopes,
        account: &Account,
    ) -> Result<TokenResult, AcquireError> {
        self.initialize().await?;

        let response = self
            .inner
            .identity
            .acquire_token_silently(scopes, account)
            .await?;

        TokenResult::from_response(response, account)
    }

    /// Starts a full-page redirect to the identity provider
    ///
    /// The user is always asked to select an account. Without scopes, the
    /// basic identity scopes are requested.
    pub async fn login_interactive(&self, scopes: Option<&Scopes>) -> Result<(), AcquireError> {
        let scopes = scopes
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(Scopes::openid_defaults);

        self.redirect(RedirectRequest {
            scopes,
            prompt: Prompt::SelectAccount,
            login_hint: None,
        })
        .await
    }

    /// Starts a redirect that signs the hinted account in without showing any UI
    pub async fn start_silent_sso(
        &self,
        scopes: &Scopes,
        login_hint: LoginHint,
    ) -> Result<(), AcquireError> {
        self.redirect(RedirectRequest {
            scopes: scopes.clone(),
            prompt: Prompt::None,
            login_hint: Some(login_hint),
        })
        .await
    }

    async fn redirect(&self, request: RedirectRequest) -> Result<(), AcquireError> {
        self.initialize().await?;
        tracing::info!(
            prompt = request.prompt.as_str(),
            scopes = %request.scopes,
            "redirecting to identity provider"
        );
        Ok(self.inner.identity.login_with_redirect(request).await?)
    }

    /// Signs in through a popup window
    pub async fn login_with_popup(
        &self,
        scopes: &Scopes,
    ) -> Result<AuthenticationResult, AcquireError> {
        self.initialize().await?;
        Ok(self.inner.identity.login_with_popup(scopes).await?)
    }

    /// Acquires a token through a popup window
    pub async fn acquire_with_popup(
        &self,
        scopes: &Scopes,
    ) -> Result<AuthenticationResult, AcquireError> {
        self.initialize().await?;
        Ok(self.inner.identity.acquire_token_with_popup(scopes).await?)
    }

    /// Signs an account out at the identity provider
    pub async fn logout(&self, account: Option<&Account>) -> Result<(), ProviderError> {
        self.initialize().await?;
        self.inner.identity.logout_with_popup(account).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::provider::InMemoryIdentityProvider;

    fn ada() -> Account {
        Account::new("ada", "ada@example.com").with_name("Ada")
    }

    fn grace() -> Account {
        Account::new("grace", "grace@example.com")
    }

    mod process_redirect_result {
        use super::*;

        #[tokio::test]
        async fn completes_a_pending_redirect_and_activates_the_account() {
            let identity = Arc::new(InMemoryIdentityProvider::new().with_pending_redirect(
                ada(),
                ClaimsSet::new().with("roles", json!(["Admin"])),
            ));
            let provider = TokenProvider::new(identity.clone());

            let outcome = provider.process_redirect_result().await.unwrap();

            match outcome {
                RedirectOutcome::Completed { account, claims } => {
                    assert_eq!(account, ada());
                    assert_eq!(claims.unwrap().roles(), vec!["Admin"]);
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
            assert_eq!(identity.active_account(), Some(ada()));
        }

        #[tokio::test]
        async fn second_call_is_a_no_op() {
            let identity =
                Arc::new(InMemoryIdentityProvider::new().with_pending_redirect(ada(), ClaimsSet::new()));
            let provider = TokenProvider::new(identity.clone());

            provider.process_redirect_result().await.unwrap();
            let second = provider.process_redirect_result().await.unwrap();

            assert_eq!(second, RedirectOutcome::AlreadyProcessed);
            assert_eq!(identity.handle_redirect_calls(), 1);
        }

        #[tokio::test]
        async fn restores_a_single_cached_account() {
            let identity =
                Arc::new(InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()));
            let provider = TokenProvider::new(identity.clone());

            let outcome = provider.process_redirect_result().await.unwrap();

            assert_eq!(outcome, RedirectOutcome::Restored(ada()));
            assert_eq!(identity.active_account(), Some(ada()));
        }

        #[tokio::test]
        async fn multiple_cached_accounts_are_ambiguous() {
            let identity = Arc::new(
                InMemoryIdentityProvider::new()
                    .with_cached_account(ada(), ClaimsSet::new())
                    .with_cached_account(grace(), ClaimsSet::new()),
            );
            let provider = TokenProvider::new(identity.clone());

            let outcome = provider.process_redirect_result().await.unwrap();

            assert_eq!(outcome, RedirectOutcome::NoSession);
            assert_eq!(identity.active_account(), None);
        }

        #[tokio::test]
        async fn failed_initialization_leaves_the_response_pending() {
            let identity = Arc::new(
                InMemoryIdentityProvider::new().with_pending_redirect(ada(), ClaimsSet::new()),
            );
            identity.fail_next_initialize(ProviderError::Transient("storage locked".into()));
            let provider = TokenProvider::new(identity.clone());

            let first = provider.process_redirect_result().await;
            assert!(matches!(first, Err(ProviderError::Transient(_))));
            assert_eq!(identity.handle_redirect_calls(), 0);

            let second = provider.process_redirect_result().await.unwrap();

            assert!(matches!(
                second,
                RedirectOutcome::Completed { ref account, .. } if *account == ada()
            ));
            assert_eq!(identity.handle_redirect_calls(), 1);
            assert_eq!(identity.initialize_calls(), 2);
        }

        #[tokio::test]
        async fn initializes_the_provider_once() {
            let identity = Arc::new(InMemoryIdentityProvider::new());
            let provider = TokenProvider::new(identity.clone());

            provider.process_redirect_result().await.unwrap();
            provider.initialize().await.unwrap();

            assert_eq!(identity.initialize_calls(), 1);
        }
    }

    mod acquire_silently {
        use super::*;

        #[tokio::test]
        async fn without_an_account_requires_interaction() {
            let provider = TokenProvider::new(Arc::new(InMemoryIdentityProvider::new()));

            let err = provider
                .acquire_silently(&Scopes::openid_defaults())
                .await
                .unwrap_err();

            assert!(err.is_interaction_required());
        }

        #[tokio::test]
        async fn returns_a_complete_token_for_the_cached_account() {
            let identity =
                Arc::new(InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()));
            let provider = TokenProvider::new(identity);

            let token = provider
                .acquire_silently(&Scopes::openid_defaults())
                .await
                .unwrap();

            assert_eq!(token.account(), &ada());
            assert!(!token.access_token().as_str().is_empty());
        }

        #[tokio::test]
        async fn classifies_provider_failures() {
            let identity =
                Arc::new(InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()));
            identity.fail_next_silent(ProviderError::Transient("timeout".into()));
            identity.fail_next_silent(ProviderError::interaction_required("consent_required"));
            let provider = TokenProvider::new(identity);
            let scopes = Scopes::openid_defaults();

            let first = provider.acquire_silently(&scopes).await.unwrap_err();
            let second = provider.acquire_silently(&scopes).await.unwrap_err();

            assert!(matches!(first, AcquireError::Transient(_)));
            assert!(matches!(
                second,
                AcquireError::InteractionRequired { code } if code == "consent_required"
            ));
        }
    }

    mod login_interactive {
        use super::*;

        #[tokio::test]
        async fn defaults_to_identity_scopes_and_account_selection() {
            let identity = Arc::new(InMemoryIdentityProvider::new());
            let provider = TokenProvider::new(identity.clone());

            provider.login_interactive(None).await.unwrap();
            provider.login_interactive(Some(&Scopes::new())).await.unwrap();

            let requests = identity.redirect_requests();
            assert_eq!(requests.len(), 2);
            for request in requests {
                assert_eq!(request.scopes, Scopes::openid_defaults());
                assert_eq!(request.prompt, Prompt::SelectAccount);
                assert_eq!(request.login_hint, None);
            }
        }

        #[tokio::test]
        async fn passes_requested_scopes_through() {
            let identity = Arc::new(InMemoryIdentityProvider::new());
            let provider = TokenProvider::new(identity.clone());
            let scopes = Scopes::single("api://backend/access_as_user");

            provider.login_interactive(Some(&scopes)).await.unwrap();

            assert_eq!(identity.redirect_requests()[0].scopes, scopes);
        }
    }
}
