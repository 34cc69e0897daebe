//! An offline identity provider that issues tokens from memory

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use keyward_clock::{Clock, DurationSecs, System};

use super::{Account, AuthenticationResult, IdentityProvider, ProviderError, RedirectRequest};
use crate::{AccessToken, AccountId, ClaimsSet, Scopes};

/// An identity provider holding its whole session store in memory
///
/// Tokens are opaque strings of the form `in-memory-<account>-<n>` with a
/// configurable lifetime. Failures can be queued up front, which makes this
/// provider suitable for local demos and for exercising the fallback paths
/// of the session coordinator.
pub struct InMemoryIdentityProvider<C = System> {
    state: Mutex<State>,
    token_lifetime: DurationSecs,
    clock: C,
}

#[derive(Default)]
struct State {
    accounts: Vec<Account>,
    claims: HashMap<AccountId, ClaimsSet>,
    active: Option<Account>,
    pending_redirect: Option<Result<AuthenticationResult, ProviderError>>,
    popup_account: Option<Account>,
    stall_redirects: bool,
    initialize_failures: VecDeque<ProviderError>,
    silent_failures: VecDeque<ProviderError>,
    popup_failures: VecDeque<ProviderError>,
    redirect_failures: VecDeque<ProviderError>,
    logout_failure: Option<ProviderError>,
    redirects: Vec<RedirectRequest>,
    issued: u64,
    initialize_calls: usize,
    handle_redirect_calls: usize,
    silent_calls: usize,
    popup_calls: usize,
    logout_calls: usize,
}

impl InMemoryIdentityProvider<System> {
    /// Constructs an empty provider issuing tokens valid for one hour
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl Default for InMemoryIdentityProvider<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemoryIdentityProvider<C> {
    /// Constructs an empty provider using a custom clock to stamp expiries
    pub fn with_clock(clock: C) -> Self {
        Self {
            state: Mutex::new(State::default()),
            token_lifetime: DurationSecs(3600),
            clock,
        }
    }

    /// Sets the lifetime of issued tokens
    #[must_use]
    pub fn with_token_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Adds an account with a cached session and the claims of its identity token
    #[must_use]
    pub fn with_cached_account(self, account: Account, claims: ClaimsSet) -> Self {
        {
            let mut state = self.lock();
            state.claims.insert(account.id().clone(), claims);
            if !state.accounts.contains(&account) {
                state.accounts.push(account);
            }
        }
        self
    }

    /// Makes the next redirect response complete a sign-in for `account`
    #[must_use]
    pub fn with_pending_redirect(self, account: Account, claims: ClaimsSet) -> Self {
        {
            let mut state = self.lock();
            state.claims.insert(account.id().clone(), claims.clone());
            state.pending_redirect = Some(Ok(AuthenticationResult {
                access_token: None,
                expires_on: None,
                account: Some(account),
                id_token_claims: Some(claims),
            }));
        }
        self
    }

    /// Makes the next redirect response fail
    #[must_use]
    pub fn with_failed_redirect(self, error: ProviderError) -> Self {
        self.lock().pending_redirect = Some(Err(error));
        self
    }

    /// Sets the account that signs in when a popup is shown
    #[must_use]
    pub fn with_popup_account(self, account: Account, claims: ClaimsSet) -> Self {
        {
            let mut state = self.lock();
            state.claims.insert(account.id().clone(), claims);
            state.popup_account = Some(account);
        }
        self
    }

    /// Makes redirects record their request and then never complete
    ///
    /// Models a navigation that is still underway when its caller gives up.
    #[must_use]
    pub fn with_stalled_redirects(self) -> Self {
        self.lock().stall_redirects = true;
        self
    }

    /// Queues a failure for the next initialization
    pub fn fail_next_initialize(&self, error: ProviderError) {
        self.lock().initialize_failures.push_back(error);
    }

    /// Queues a failure for the next silent token request
    pub fn fail_next_silent(&self, error: ProviderError) {
        self.lock().silent_failures.push_back(error);
    }

    /// Queues a failure for the next popup
    pub fn fail_next_popup(&self, error: ProviderError) {
        self.lock().popup_failures.push_back(error);
    }

    /// Queues a failure for the next redirect
    pub fn fail_next_redirect(&self, error: ProviderError) {
        self.lock().redirect_failures.push_back(error);
    }

    /// Makes every logout fail
    pub fn fail_logout(&self, error: ProviderError) {
        self.lock().logout_failure = Some(error);
    }

    /// Removes every cached session, as an expired refresh credential would
    pub fn forget_sessions(&self) {
        let mut state = self.lock();
        state.accounts.clear();
        state.active = None;
    }

    /// Redirects requested so far
    pub fn redirect_requests(&self) -> Vec<RedirectRequest> {
        self.lock().redirects.clone()
    }

    /// Number of calls to `initialize`
    pub fn initialize_calls(&self) -> usize {
        self.lock().initialize_calls
    }

    /// Number of calls to `handle_redirect_response`
    pub fn handle_redirect_calls(&self) -> usize {
        self.lock().handle_redirect_calls
    }

    /// Number of silent token requests
    pub fn silent_calls(&self) -> usize {
        self.lock().silent_calls
    }

    /// Number of popups shown
    pub fn popup_calls(&self) -> usize {
        self.lock().popup_calls
    }

    /// Number of logout attempts
    pub fn logout_calls(&self) -> usize {
        self.lock().logout_calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock> InMemoryIdentityProvider<C> {
    fn issue(&self, state: &mut State, account: &Account) -> AuthenticationResult {
        state.issued += 1;
        let token = format!("in-memory-{}-{}", account.id(), state.issued);
        tracing::trace!(account = %account.id(), serial = state.issued, "issuing token");

        AuthenticationResult {
            access_token: Some(AccessToken::new(token)),
            expires_on: Some(self.clock.now() + self.token_lifetime),
            account: Some(account.clone()),
            id_token_claims: state.claims.get(account.id()).cloned(),
        }
    }

    fn sign_in_with_popup(&self) -> Result<AuthenticationResult, ProviderError> {
        let mut state = self.lock();
        state.popup_calls += 1;

        if let Some(error) = state.popup_failures.pop_front() {
            return Err(error);
        }

        let account = state
            .popup_account
            .clone()
            .or_else(|| state.accounts.first().cloned())
            .ok_or_else(|| ProviderError::interaction_required("user_cancelled"))?;

        if !state.accounts.contains(&account) {
            state.accounts.push(account.clone());
        }

        Ok(self.issue(&mut state, &account))
    }
}

impl<C> fmt::Debug for InMemoryIdentityProvider<C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryIdentityProvider")
            .field("accounts", &state.accounts)
            .field("active", &state.active)
            .field("issued", &state.issued)
            .field("token_lifetime", &self.token_lifetime)
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl<C> IdentityProvider for InMemoryIdentityProvider<C>
where
    C: Clock + Send + Sync,
{
    async fn initialize(&self) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.initialize_calls += 1;

        match state.initialize_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn handle_redirect_response(
        &self,
    ) -> Result<Option<AuthenticationResult>, ProviderError> {
        let mut state = self.lock();
        state.handle_redirect_calls += 1;

        match state.pending_redirect.take() {
            Some(Ok(result)) => {
                if let Some(account) = &result.account {
                    if !state.accounts.contains(account) {
                        state.accounts.push(account.clone());
                    }
                }
                Ok(Some(result))
            }
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }

    fn cached_accounts(&self) -> Vec<Account> {
        self.lock().accounts.clone()
    }

    fn active_account(&self) -> Option<Account> {
        self.lock().active.clone()
    }

    fn set_active_account(&self, account: Option<Account>) {
        self.lock().active = account;
    }

    async fn acquire_token_silently(
        &self,
        _scopes: &Scopes,
        account: &Account,
    ) -> Result<AuthenticationResult, ProviderError> {
        let mut state = self.lock();
        state.silent_calls += 1;

        if let Some(error) = state.silent_failures.pop_front() {
            return Err(error);
        }

        if !state.accounts.contains(account) {
            return Err(ProviderError::interaction_required("no_tokens_found"));
        }

        Ok(self.issue(&mut state, account))
    }

    async fn login_with_redirect(&self, request: RedirectRequest) -> Result<(), ProviderError> {
        let stalled = {
            let mut state = self.lock();
            tracing::debug!(prompt = request.prompt.as_str(), scopes = %request.scopes, "redirect requested");
            state.redirects.push(request);

            if let Some(error) = state.redirect_failures.pop_front() {
                return Err(error);
            }
            state.stall_redirects
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn login_with_popup(
        &self,
        _scopes: &Scopes,
    ) -> Result<AuthenticationResult, ProviderError> {
        self.sign_in_with_popup()
    }

    async fn acquire_token_with_popup(
        &self,
        _scopes: &Scopes,
    ) -> Result<AuthenticationResult, ProviderError> {
        self.sign_in_with_popup()
    }

    async fn logout_with_popup(&self, account: Option<&Account>) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.logout_calls += 1;

        if let Some(error) = state.logout_failure.clone() {
            return Err(error);
        }

        match account {
            Some(account) => state.accounts.retain(|a| a != account),
            None => state.accounts.clear(),
        }
        state.active = None;
        Ok(())
    }
}
