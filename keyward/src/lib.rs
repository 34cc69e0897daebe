//! Session coordination for OpenID-Connect single-page clients
//!
//! This library sits between an application and an OpenID-Connect identity
//! provider. The provider does the protocol work; this crate decides when to
//! call it and keeps the application's view of the session consistent.
//!
//! In particular, it processes redirect responses exactly once per load,
//! restores a cached session on start-up, renews tokens in the background
//! shortly before they expire, and makes sure that no matter how many parts of
//! the application notice that the user must sign in again, only one
//! full-page redirect is ever started.
//!
//! # General Flow
//!
//! On start-up, load the [`AuthConfig`], wrap your [`IdentityProvider`][provider::IdentityProvider]
//! in a [`TokenProvider`] and hand both to a [`SessionCoordinator`]. Share a
//! single [`RedirectGuard`] between the coordinator, the [`RefreshScheduler`]
//! and any HTTP middleware that may need to send the user to sign in.
//!
//! ```
//! use std::sync::Arc;
//!
//! use keyward::{
//!     provider::{Account, InMemoryIdentityProvider},
//!     AuthConfig, ClaimsSet, RedirectGuard, RefreshScheduler, SessionCoordinator, SessionStatus,
//!     TokenProvider,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let config = AuthConfig::from_json(r#"{
//!     "clientId": "spa-client",
//!     "authority": "https://login.example.com/contoso",
//!     "redirectUri": "https://app.example.com/",
//!     "apiScope": "api://backend/access_as_user",
//!     "apiBaseUrl": "https://api.example.com"
//! }"#).unwrap();
//!
//! let identity = InMemoryIdentityProvider::new()
//!     .with_cached_account(Account::new("ada", "ada@example.com"), ClaimsSet::new());
//! let provider = TokenProvider::new(Arc::new(identity));
//! let guard = RedirectGuard::new();
//!
//! let coordinator = SessionCoordinator::new(provider.clone(), guard.clone(), &config);
//! coordinator.initialize().await;
//! assert_eq!(coordinator.status(), SessionStatus::ReadySession);
//!
//! let refresh = RefreshScheduler::new(provider, guard, config.api_scopes()).spawn();
//! refresh.cancel();
//! # }
//! ```
//!
//! Application code then asks the coordinator for tokens or protected
//! resources, and observes session changes through a [`SessionWatcher`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod claims;
mod config;
mod coordinator;
mod guard;
pub mod provider;
mod refresh;
mod scope;
mod session;
mod strategy;
mod token_provider;
mod tokens;

pub use braids::*;
pub use claims::{extract_roles, ClaimsSet};
pub use config::{AuthConfig, ConfigError};
pub use coordinator::{ResourceError, ResourceResponse, SessionCoordinator, SsoAttempt};
pub use guard::{RedirectAttempt, RedirectGuard};
pub use refresh::{NextCycle, RefreshConfig, RefreshExit, RefreshHandle, RefreshScheduler};
pub use scope::{Scope, ScopeRef, Scopes};
pub use session::{
    BorrowedSession, SessionClosed, SessionPhase, SessionState, SessionStatus, SessionWatcher,
    SignedIn,
};
pub use strategy::{AcquisitionChain, ChainFailure, Fallthrough, StepFailure, Strategy};
pub use token_provider::{AcquireError, RedirectOutcome, TokenProvider};
pub use tokens::{TokenResult, TokenStatus};
