//! The session state machine

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use reqwest::{header, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use url::Url;

use crate::{
    config::AuthConfig,
    provider::{Account, ProviderError},
    session::{SessionPhase, SessionState, SessionStatus, SessionWatcher},
    AccessToken, AcquireError, AcquisitionChain, ClaimsSet, LoginHint, RedirectGuard,
    RedirectOutcome, Scopes, TokenProvider,
};

const LOGIN_HINT_PARAMS: [&str; 2] = ["login_hint", "username"];

/// Why a protected resource could not be fetched
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Nobody is signed in
    #[error("not signed in")]
    NotSignedIn,
    /// Neither silent nor interactive acquisition produced a token
    #[error("token acquisition failed")]
    TokenAcquisitionFailed,
    /// Acquisition succeeded without yielding a token
    #[error("no token obtained")]
    NoTokenObtained,
    /// The API answered with a non-success status
    #[error("API error {}", .0.as_u16())]
    Api(StatusCode),
    /// The API could not be reached or answered with an unreadable body
    #[error("network error")]
    Network,
}

/// The outcome of fetching a protected resource
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceResponse {
    /// The JSON body returned by the API
    Data(Value),
    /// Why no data is available
    Error(ResourceError),
}

impl ResourceResponse {
    /// The returned data, if the call succeeded
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Data(data) => Some(data),
            Self::Error(_) => None,
        }
    }

    /// The failure reason, if the call failed
    pub fn error(&self) -> Option<&ResourceError> {
        match self {
            Self::Data(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

impl From<ResourceError> for ResourceResponse {
    fn from(error: ResourceError) -> Self {
        Self::Error(error)
    }
}

/// The result of a silent single-sign-on attempt
#[derive(Debug)]
pub enum SsoAttempt {
    /// The page was not launched with a login hint
    NoLoginHint,
    /// An account is already signed in
    AlreadySignedIn,
    /// Single sign-on was already attempted during this load
    AlreadyAttempted,
    /// Another redirect is in flight
    RedirectInProgress,
    /// The redirect started
    Started,
    /// The redirect could not be started; a later attempt may retry
    Failed(AcquireError),
}

/// Owns the signed-in account and drives sign-in, sign-out and token requests
///
/// Share it behind an `Arc`. Every operation first waits for start-up
/// (redirect processing and session restoration), which runs once no matter
/// how many callers trigger it.
pub struct SessionCoordinator {
    provider: TokenProvider,
    guard: RedirectGuard,
    http: ClientWithMiddleware,
    login_scopes: Scopes,
    api_scopes: Scopes,
    api_base_url: Url,
    page_url: Option<Url>,
    state: watch::Sender<SessionState>,
    initialized: OnceCell<()>,
    sso_attempted: AtomicBool,
    alive: AtomicBool,
}

impl fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("provider", &self.provider)
            .field("guard", &self.guard)
            .field("login_scopes", &self.login_scopes)
            .field("api_scopes", &self.api_scopes)
            .field("api_base_url", &self.api_base_url)
            .field("page_url", &self.page_url)
            .field("state", &*self.state.borrow())
            .field("alive", &self.alive.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    /// Constructs a coordinator for the given registration
    pub fn new(provider: TokenProvider, guard: RedirectGuard, config: &AuthConfig) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            provider,
            guard,
            http: ClientWithMiddleware::from(reqwest::Client::new()),
            login_scopes: config.login_scopes.clone(),
            api_scopes: config.api_scopes(),
            api_base_url: config.api_base_url.clone(),
            page_url: None,
            state,
            initialized: OnceCell::new(),
            sso_attempted: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    /// Uses a custom HTTP client for protected resource calls
    #[must_use]
    pub fn with_http_client(mut self, http: impl Into<ClientWithMiddleware>) -> Self {
        self.http = http.into();
        self
    }

    /// Sets the URL the application was launched with
    ///
    /// A `login_hint` or `username` query parameter on this URL triggers
    /// silent single sign-on during start-up.
    #[must_use]
    pub fn with_page_url(mut self, page_url: Url) -> Self {
        self.page_url = Some(page_url);
        self
    }

    /// Subscribes to session state changes
    pub fn subscribe(&self) -> SessionWatcher {
        SessionWatcher::new(self.state.subscribe())
    }

    /// A snapshot of the session state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// The position in the session state machine
    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status()
    }

    /// Whether start-up has finished
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// The account to act on behalf of
    ///
    /// The signed-in account, else the provider's active account, else the
    /// first cached account.
    pub fn account(&self) -> Option<Account> {
        let signed_in = self.state.borrow().account().cloned();
        signed_in.or_else(|| self.provider.active_account())
    }

    /// The identity token claims of the signed-in account
    pub fn claims(&self) -> Option<ClaimsSet> {
        self.state.borrow().claims().cloned()
    }

    /// The roles granted to the signed-in account
    pub fn roles(&self) -> Vec<String> {
        self.state
            .borrow()
            .claims()
            .map(ClaimsSet::roles)
            .unwrap_or_default()
    }

    /// Stops publishing state
    ///
    /// Operations still in flight complete, but their effects on the
    /// session state are discarded.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        tracing::debug!("session coordinator shut down");
    }

    fn update(&self, modify: impl FnOnce(&mut SessionState)) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            tracing::trace!("discarding session update after shutdown");
            return false;
        }
        self.state.send_modify(modify);
        true
    }

    /// Runs start-up if it has not run yet and waits for it to finish
    ///
    /// If the identity provider cannot be initialized, the session falls
    /// back to uninitialized and the next call tries again.
    pub async fn initialize(&self) {
        let _ = self
            .initialized
            .get_or_try_init(|| self.run_initialization())
            .await;
    }

    async fn run_initialization(&self) -> Result<(), ProviderError> {
        self.update(|s| s.set_phase(SessionPhase::Initializing));

        if let Err(error) = self.provider.initialize().await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "identity provider failed to initialize, start-up will be retried"
            );
            self.update(|s| s.set_phase(SessionPhase::Uninitialized));
            return Err(error);
        }

        let mut restorable = None;
        match self.provider.process_redirect_result().await {
            Ok(RedirectOutcome::Completed { account, claims }) => {
                tracing::info!(account = %account.id(), "sign-in completed by redirect");
                self.provider.set_active_account(Some(account.clone()));
                self.update(|s| s.sign_in(account, claims));
                self.guard.release();
            }
            Ok(RedirectOutcome::Restored(account)) => restorable = Some(account),
            Ok(RedirectOutcome::NoSession) => {
                tracing::debug!("no redirect response");
            }
            Ok(RedirectOutcome::AlreadyProcessed) => {}
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "processing the redirect response failed"
                );
                self.guard.release();
            }
        }

        let signed_in = self.state.borrow().account().is_some();
        if !signed_in {
            let cached = restorable.or_else(|| self.provider.accounts().into_iter().next());
            match cached {
                Some(account) => self.restore(account).await,
                None => {
                    let attempt = self.start_sso().await;
                    tracing::debug!(?attempt, "single sign-on check");
                }
            }
        }

        self.update(|s| s.set_phase(SessionPhase::Ready));
        tracing::debug!(status = ?self.status(), "session ready");
        Ok(())
    }

    async fn restore(&self, account: Account) {
        tracing::debug!(account = %account.id(), "restoring cached account");
        self.provider.set_active_account(Some(account.clone()));
        self.update(|s| s.sign_in(account.clone(), None));

        match self
            .provider
            .acquire_silently_for(&self.login_scopes, &account)
            .await
        {
            Ok(token) => {
                let claims = token.id_token_claims().cloned();
                self.update(|s| {
                    s.update_claims(&account, claims);
                });
            }
            Err(error) if error.is_interaction_required() => {
                tracing::info!("restored account needs interaction before claims are available");
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "silent acquisition for restored account failed"
                );
            }
        }
    }

    /// Signs in interactively through a popup
    ///
    /// Returns the signed-in account, or `None` if sign-in failed, in which
    /// case the session is left untouched.
    pub async fn login(&self) -> Option<Account> {
        self.initialize().await;

        match self.provider.login_with_popup(&self.login_scopes).await {
            Ok(result) => match result.account {
                Some(account) => {
                    tracing::info!(account = %account.id(), "signed in");
                    self.provider.set_active_account(Some(account.clone()));
                    let claims = result.id_token_claims;
                    self.update(|s| s.sign_in(account.clone(), claims));
                    Some(account)
                }
                None => {
                    tracing::error!("sign-in completed without an account");
                    None
                }
            },
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "sign-in failed"
                );
                None
            }
        }
    }

    /// Signs out at the provider and clears the session
    ///
    /// The session is cleared even when the provider fails to sign out; the
    /// provider's error is still returned.
    pub async fn logout(&self) -> Result<(), ProviderError> {
        self.initialize().await;

        let account = self.account();
        let result = self.provider.logout(account.as_ref()).await;
        self.update(SessionState::sign_out);

        match &result {
            Ok(()) => tracing::info!("signed out"),
            Err(error) => tracing::warn!(
                error = (error as &dyn std::error::Error),
                "provider sign-out failed, local session cleared anyway"
            ),
        }
        result
    }

    /// Gets an access token, silently if possible and through a popup otherwise
    ///
    /// Returns `None` if nobody is signed in or both attempts fail.
    pub async fn get_access_token(&self, scopes: &Scopes) -> Option<AccessToken> {
        self.initialize().await;
        let account = self.account()?;

        match AcquisitionChain::silent_then_popup()
            .run(&self.provider, scopes, &account)
            .await
        {
            Ok(result) => result.access_token.filter(|t| !t.as_str().is_empty()),
            Err(failure) => {
                tracing::error!(%failure, "token acquisition failed");
                None
            }
        }
    }

    /// Calls the protected API profile endpoint
    pub async fn fetch_profile(&self) -> ResourceResponse {
        let scopes = self.api_scopes.clone();
        self.fetch_protected_resource(&scopes, "/api/profile").await
    }

    /// Calls a protected API endpoint with a bearer token for `scopes`
    ///
    /// `endpoint` is resolved against the configured API base URL. Failures
    /// are reported in the response rather than returned as errors.
    pub async fn fetch_protected_resource(
        &self,
        scopes: &Scopes,
        endpoint: &str,
    ) -> ResourceResponse {
        self.initialize().await;

        let Some(account) = self.account() else {
            return ResourceError::NotSignedIn.into();
        };

        let token = match AcquisitionChain::silent_then_popup_on_interaction()
            .run(&self.provider, scopes, &account)
            .await
        {
            Ok(result) => result.access_token,
            Err(failure) => {
                tracing::error!(%failure, "token acquisition for API call failed");
                return ResourceError::TokenAcquisitionFailed.into();
            }
        };

        let Some(token) = token.filter(|t| !t.as_str().is_empty()) else {
            return ResourceError::NoTokenObtained.into();
        };

        let url = match self.api_base_url.join(endpoint) {
            Ok(url) => url,
            Err(error) => {
                tracing::error!(%error, endpoint, "invalid API endpoint");
                return ResourceError::Network.into();
            }
        };

        let response = self
            .http
            .get(url.clone())
            .bearer_auth(token.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(error = (&error as &dyn std::error::Error), %url, "API call failed");
                return ResourceError::Network.into();
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), %url, "API returned an error status");
            return ResourceError::Api(status).into();
        }

        match response.json::<Value>().await {
            Ok(data) => ResourceResponse::Data(data),
            Err(error) => {
                tracing::error!(error = (&error as &dyn std::error::Error), %url, "API returned an unreadable body");
                ResourceError::Network.into()
            }
        }
    }

    /// Starts silent single sign-on if the page was launched with a login hint
    ///
    /// Runs at most once per load unless the previous attempt failed.
    pub async fn attempt_silent_sso(&self) -> SsoAttempt {
        self.initialize().await;
        self.start_sso().await
    }

    async fn start_sso(&self) -> SsoAttempt {
        let Some(login_hint) = self.login_hint() else {
            return SsoAttempt::NoLoginHint;
        };

        if self.state.borrow().account().is_some() {
            return SsoAttempt::AlreadySignedIn;
        }

        if self.sso_attempted.load(Ordering::Acquire) {
            return SsoAttempt::AlreadyAttempted;
        }

        if !self.guard.try_acquire() {
            return SsoAttempt::RedirectInProgress;
        }

        if self.sso_attempted.swap(true, Ordering::AcqRel) {
            self.guard.release();
            return SsoAttempt::AlreadyAttempted;
        }

        tracing::info!(%login_hint, "launched with a login hint, starting silent sign-on");
        match self
            .provider
            .start_silent_sso(&self.login_scopes, login_hint)
            .await
        {
            Ok(()) => SsoAttempt::Started,
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "silent sign-on redirect failed"
                );
                self.guard.release();
                self.sso_attempted.store(false, Ordering::Release);
                SsoAttempt::Failed(error)
            }
        }
    }

    fn login_hint(&self) -> Option<LoginHint> {
        let page_url = self.page_url.as_ref()?;
        LOGIN_HINT_PARAMS.iter().find_map(|name| {
            page_url
                .query_pairs()
                .find(|(key, value)| key == name && !value.is_empty())
                .map(|(_, value)| LoginHint::new(value.into_owned()))
        })
    }
}
