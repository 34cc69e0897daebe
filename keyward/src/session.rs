use std::ops;

use tokio::sync::watch;

use crate::{provider::Account, ClaimsSet};

/// How far session start-up has progressed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing has happened yet
    #[default]
    Uninitialized,
    /// Redirect processing or session restoration is underway
    Initializing,
    /// Start-up finished, with or without a session
    Ready,
}

/// The externally visible state of the session state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Nothing has happened yet
    Uninitialized,
    /// Redirect processing or session restoration is underway
    Initializing,
    /// Start-up finished and nobody is signed in
    ReadyNoSession,
    /// Start-up finished and an account is signed in
    ReadySession,
}

/// A signed-in account with the claims of its identity token
#[derive(Clone, Debug, PartialEq)]
pub struct SignedIn {
    account: Account,
    claims: Option<ClaimsSet>,
}

impl SignedIn {
    pub(crate) fn new(account: Account, claims: Option<ClaimsSet>) -> Self {
        Self { account, claims }
    }

    /// The signed-in account
    #[inline]
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The identity token claims, once a token has been obtained
    #[inline]
    pub fn claims(&self) -> Option<&ClaimsSet> {
        self.claims.as_ref()
    }
}

/// A snapshot of the session
///
/// Claims can only exist alongside an account; both disappear together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    phase: SessionPhase,
    signed_in: Option<SignedIn>,
}

impl SessionState {
    /// The start-up phase
    #[inline]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether start-up has finished
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    /// The signed-in account and claims, if any
    #[inline]
    pub fn signed_in(&self) -> Option<&SignedIn> {
        self.signed_in.as_ref()
    }

    /// The signed-in account, if any
    pub fn account(&self) -> Option<&Account> {
        self.signed_in.as_ref().map(SignedIn::account)
    }

    /// The identity token claims, if any
    pub fn claims(&self) -> Option<&ClaimsSet> {
        self.signed_in.as_ref().and_then(SignedIn::claims)
    }

    /// The combined state machine position
    pub fn status(&self) -> SessionStatus {
        match (self.phase, &self.signed_in) {
            (SessionPhase::Uninitialized, _) => SessionStatus::Uninitialized,
            (SessionPhase::Initializing, _) => SessionStatus::Initializing,
            (SessionPhase::Ready, None) => SessionStatus::ReadyNoSession,
            (SessionPhase::Ready, Some(_)) => SessionStatus::ReadySession,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    pub(crate) fn sign_in(&mut self, account: Account, claims: Option<ClaimsSet>) {
        self.signed_in = Some(SignedIn::new(account, claims));
    }

    /// Replaces the claims if `account` is still the one signed in
    pub(crate) fn update_claims(&mut self, account: &Account, claims: Option<ClaimsSet>) -> bool {
        match &mut self.signed_in {
            Some(signed_in) if &signed_in.account == account => {
                signed_in.claims = claims;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn sign_out(&mut self) {
        self.signed_in = None;
    }
}

/// A receiver of session state updates
#[derive(Clone, Debug)]
pub struct SessionWatcher {
    watcher: watch::Receiver<SessionState>,
}

/// An outstanding borrow of the session state
///
/// This borrow should be held for as brief a time as possible, as outstanding
/// borrows block publication of new state.
#[derive(Debug)]
pub struct BorrowedSession<'a> {
    inner: watch::Ref<'a, SessionState>,
}

impl<'a> ops::Deref for BorrowedSession<'a> {
    type Target = SessionState;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// The coordinator publishing session state was dropped
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("session coordinator is gone")]
pub struct SessionClosed {
    _p: (),
}

impl SessionWatcher {
    pub(crate) fn new(watcher: watch::Receiver<SessionState>) -> Self {
        Self { watcher }
    }

    /// Borrows the current session state
    pub fn state(&self) -> BorrowedSession<'_> {
        BorrowedSession {
            inner: self.watcher.borrow(),
        }
    }

    /// Waits until the state changes
    pub async fn changed(&mut self) -> Result<(), SessionClosed> {
        self.watcher
            .changed()
            .await
            .map_err(|_| SessionClosed { _p: () })
    }

    /// Waits until start-up has finished
    pub async fn ready(&mut self) -> Result<SessionState, SessionClosed> {
        self.watcher
            .wait_for(SessionState::is_ready)
            .await
            .map(|state| state.clone())
            .map_err(|_| SessionClosed { _p: () })
    }
}
