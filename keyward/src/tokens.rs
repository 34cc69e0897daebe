use keyward_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    provider::{Account, AuthenticationResult},
    AccessToken, AccessTokenRef, AcquireError, ClaimsSet,
};

/// A complete token as returned by a successful acquisition
///
/// Unlike an [`AuthenticationResult`], a `TokenResult` always carries a
/// non-empty access token and a concrete expiry. It is never updated in
/// place; every acquisition produces a new one.
#[derive(Clone, Debug)]
pub struct TokenResult {
    access_token: AccessToken,
    expires_on: UnixTime,
    account: Account,
    id_token_claims: Option<ClaimsSet>,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid
    Valid,
    /// The token is no longer valid
    Expired,
}

impl TokenResult {
    /// Validates a raw provider response
    ///
    /// `requested_for` is used when the response does not name the account.
    pub fn from_response(
        response: AuthenticationResult,
        requested_for: &Account,
    ) -> Result<Self, AcquireError> {
        let access_token = response
            .access_token
            .filter(|t| !t.as_str().is_empty())
            .ok_or(AcquireError::IncompleteResponse("access token"))?;
        let expires_on = response
            .expires_on
            .ok_or(AcquireError::IncompleteResponse("expiry"))?;

        Ok(Self {
            access_token,
            expires_on,
            account: response.account.unwrap_or_else(|| requested_for.clone()),
            id_token_claims: response.id_token_claims,
        })
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expires_on(&self) -> UnixTime {
        self.expires_on
    }

    /// Gets the account the token was issued to
    #[inline]
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Gets the identity token claims delivered alongside the token, if any
    #[inline]
    pub fn id_token_claims(&self) -> Option<&ClaimsSet> {
        self.id_token_claims.as_ref()
    }

    /// Gets the token's current lifetime status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_at(System.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.expires_on {
            TokenStatus::Valid
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_on - time
    }
}

impl From<TokenResult> for AuthenticationResult {
    fn from(token: TokenResult) -> Self {
        AuthenticationResult {
            access_token: Some(token.access_token),
            expires_on: Some(token.expires_on),
            account: Some(token.account),
            id_token_claims: token.id_token_claims,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("acct-1", "ada@example.com")
    }

    fn complete() -> AuthenticationResult {
        AuthenticationResult {
            access_token: Some(AccessToken::from_static("token")),
            expires_on: Some(UnixTime(1_000)),
            account: None,
            id_token_claims: None,
        }
    }

    #[test]
    fn complete_response_is_accepted() {
        let token = TokenResult::from_response(complete(), &account()).unwrap();
        assert_eq!(token.access_token().as_str(), "token");
        assert_eq!(token.expires_on(), UnixTime(1_000));
        assert_eq!(token.account(), &account());
    }

    #[test]
    fn missing_expiry_is_rejected() {
        let response = AuthenticationResult {
            expires_on: None,
            ..complete()
        };
        let err = TokenResult::from_response(response, &account()).unwrap_err();
        assert!(matches!(err, AcquireError::IncompleteResponse("expiry")));
    }

    #[test]
    fn empty_token_is_rejected() {
        let response = AuthenticationResult {
            access_token: Some(AccessToken::from_static("")),
            ..complete()
        };
        let err = TokenResult::from_response(response, &account()).unwrap_err();
        assert!(matches!(err, AcquireError::IncompleteResponse("access token")));
    }

    #[test]
    fn status_flips_at_expiry() {
        let token = TokenResult::from_response(complete(), &account()).unwrap();
        assert_eq!(token.token_status_at(UnixTime(999)), TokenStatus::Valid);
        assert_eq!(token.token_status_at(UnixTime(1_000)), TokenStatus::Expired);
        assert_eq!(token.until_expired_at(UnixTime(400)), DurationSecs(600));
    }
}
