//! The identity provider capability consumed by this crate
//!
//! The protocol work (authorization-code exchange, token caching, signature
//! validation) lives behind [`IdentityProvider`]. This crate only decides
//! _when_ to call it and what to do with the outcome.

use async_trait::async_trait;
use keyward_clock::UnixTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AccessToken, AccountId, ClaimsSet, LoginHint, Scopes};

mod in_memory;

pub use in_memory::InMemoryIdentityProvider;

/// An account known to the identity provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    username: String,
    name: Option<String>,
}

impl Account {
    /// Constructs a new account handle
    pub fn new(id: impl Into<AccountId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            name: None,
        }
    }

    /// Sets the display name of the account
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The unique identifier of the account
    #[inline]
    pub fn id(&self) -> &AccountId {
        &self.id
    }

    /// The sign-in name of the account
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The name to show for the account, falling back to the username
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.username)
    }
}

/// The raw result of a token request
///
/// Providers may omit any part of the response; [`TokenProvider`][crate::TokenProvider]
/// is responsible for rejecting incomplete results where a full token is required.
#[derive(Clone, Debug, Default)]
pub struct AuthenticationResult {
    /// The access token, if one was issued
    pub access_token: Option<AccessToken>,
    /// When the access token expires
    pub expires_on: Option<UnixTime>,
    /// The account the token was issued to
    pub account: Option<Account>,
    /// Claims from the accompanying identity token
    pub id_token_claims: Option<ClaimsSet>,
}

/// How the identity provider should prompt the user during an interactive login
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Prompt {
    /// Always ask the user to pick an account
    SelectAccount,
    /// Never show any UI; fails if interaction would be needed
    None,
    /// Force the user to re-enter credentials
    Login,
    /// Ask the user to consent again
    Consent,
}

impl Prompt {
    /// The value of the `prompt` parameter sent to the authority
    pub const fn as_str(self) -> &'static str {
        match self {
            Prompt::SelectAccount => "select_account",
            Prompt::None => "none",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
        }
    }
}

/// A request for a full-page redirect to the identity provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectRequest {
    /// The scopes to consent to
    pub scopes: Scopes,
    /// The prompt behaviour
    pub prompt: Prompt,
    /// The account to pre-select, if known
    pub login_hint: Option<LoginHint>,
}

/// A failure reported by the identity provider
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The user must interact with the identity provider before a token can be issued
    #[error("user interaction required ({code})")]
    InteractionRequired {
        /// The provider's error code, such as `consent_required`
        code: String,
    },
    /// A network or server condition that may succeed on retry
    #[error("identity provider temporarily unavailable: {0}")]
    Transient(String),
    /// A malformed response or misconfiguration
    #[error("identity provider protocol error: {0}")]
    Protocol(String),
}

impl ProviderError {
    /// Constructs an interaction-required error with the given code
    pub fn interaction_required(code: impl Into<String>) -> Self {
        Self::InteractionRequired { code: code.into() }
    }

    /// Whether the user must interact with the provider to proceed
    pub fn is_interaction_required(&self) -> bool {
        matches!(self, Self::InteractionRequired { .. })
    }
}

/// The capability surface of an OpenID-Connect identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Prepares the provider for use
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Processes the response of a completed redirect, if the current load is one
    async fn handle_redirect_response(&self)
        -> Result<Option<AuthenticationResult>, ProviderError>;

    /// All accounts with a cached session
    fn cached_accounts(&self) -> Vec<Account>;

    /// The account used for implicit lookups
    fn active_account(&self) -> Option<Account>;

    /// Sets or clears the account used for implicit lookups
    fn set_active_account(&self, account: Option<Account>);

    /// Obtains a token without user interaction
    async fn acquire_token_silently(
        &self,
        scopes: &Scopes,
        account: &Account,
    ) -> Result<AuthenticationResult, ProviderError>;

    /// Navigates away to the identity provider
    ///
    /// A successful return means the navigation has started.
    async fn login_with_redirect(&self, request: RedirectRequest) -> Result<(), ProviderError>;

    /// Signs the user in through a popup window
    async fn login_with_popup(&self, scopes: &Scopes)
        -> Result<AuthenticationResult, ProviderError>;

    /// Obtains a token through a popup window
    async fn acquire_token_with_popup(
        &self,
        scopes: &Scopes,
    ) -> Result<AuthenticationResult, ProviderError>;

    /// Signs the account out through a popup window
    async fn logout_with_popup(&self, account: Option<&Account>) -> Result<(), ProviderError>;
}
