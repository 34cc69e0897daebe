//! Static configuration of the application registration

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{ClientId, Scope, Scopes};

/// Where the application is registered and which API it calls
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// The application (client) ID of the registration
    pub client_id: ClientId,
    /// The authority, usually including the tenant
    pub authority: Url,
    /// The redirect URI registered for the application
    pub redirect_uri: Url,
    /// The scope identifying the protected API
    pub api_scope: Scope,
    /// The base URL of the protected API
    pub api_base_url: Url,
    /// Scopes requested when signing in
    #[serde(default = "Scopes::openid_defaults")]
    pub login_scopes: Scopes,
}

/// The configuration could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document was not valid
    #[error("invalid configuration document")]
    Parse(#[from] serde_json::Error),
    /// The API base URL cannot be used to build request URLs
    #[error("API base URL `{0}` cannot be a base")]
    ApiBaseUrl(Url),
}

impl AuthConfig {
    /// Loads configuration from a JSON document
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that deserialization alone cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.cannot_be_a_base() {
            return Err(ConfigError::ApiBaseUrl(self.api_base_url.clone()));
        }
        Ok(())
    }

    /// The scopes needed to call the protected API
    pub fn api_scopes(&self) -> Scopes {
        Scopes::single(self.api_scope.clone())
    }
}
