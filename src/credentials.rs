//! Credential resolution: which secret a request carries, and where it goes.

use crate::client::ClientError;
use crate::config::ServerConfig;
use crate::options::{Credentials, SecretString};
use crate::providers::{AuthStyle, ProviderDescriptor};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Supplied with the request.
    Caller,
    /// The server's fallback key for the provider.
    Server,
}

/// The credential a request will carry.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub provider: String,
    pub source: CredentialSource,
    secret: SecretString,
}

/// A credential attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPlacement {
    Header { name: String, value: SecretString },
    Query { name: String, value: SecretString },
}

impl ResolvedCredential {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Where this credential goes for the given auth style.
    pub fn placement(&self, style: AuthStyle) -> AuthPlacement {
        match style {
            AuthStyle::Bearer => AuthPlacement::Header {
                name: "Authorization".to_string(),
                value: format!("Bearer {}", self.secret.expose_secret().trim()).into(),
            },
            AuthStyle::Header(name) => AuthPlacement::Header {
                name: name.to_string(),
                value: self.secret.clone(),
            },
            AuthStyle::QueryParam(name) => AuthPlacement::Query {
                name: name.to_string(),
                value: self.secret.clone(),
            },
        }
    }
}

/// Pick the credential for one request.
///
/// A caller key always wins. Without one, the caller must pass the access code
/// check (when the server has codes) and then gets the server key for exactly
/// this provider. No provider ever receives another provider's key.
pub fn resolve(
    descriptor: &ProviderDescriptor,
    supplied: &Credentials,
    config: &ServerConfig,
) -> Result<ResolvedCredential, ClientError> {
    let caller_key = supplied.api_key.as_ref().filter(|key| !key.is_blank());
    if let Some(key) = caller_key {
        let secret = match supplied.api_secret.as_ref().filter(|s| !s.is_blank()) {
            Some(api_secret) if descriptor.pairs_secret => pair(key, api_secret),
            _ => key.clone(),
        };
        return Ok(ResolvedCredential {
            provider: descriptor.id.clone(),
            source: CredentialSource::Caller,
            secret,
        });
    }

    if config.needs_access_code() {
        let code = supplied
            .access_code
            .as_ref()
            .map(|code| code.expose_secret().trim())
            .unwrap_or_default();
        if code.is_empty() {
            return Err(ClientError::Unauthorized {
                status: None,
                message: "empty access code".to_string(),
            });
        }
        if !config.is_access_code_valid(code) {
            return Err(ClientError::Unauthorized {
                status: None,
                message: "wrong access code".to_string(),
            });
        }
    }

    let server_key = config.fallback_key(&descriptor.id).filter(|key| !key.is_blank());
    let secret = match server_key {
        Some(key) if descriptor.pairs_secret => config
            .fallback_secret(&descriptor.id)
            .map(|secret| pair(key, secret)),
        Some(key) => Some(key.clone()),
        None => None,
    };

    secret
        .map(|secret| ResolvedCredential {
            provider: descriptor.id.clone(),
            source: CredentialSource::Server,
            secret,
        })
        .ok_or_else(|| ClientError::NoCredential {
            provider: descriptor.id.clone(),
        })
}

fn pair(key: &SecretString, secret: &SecretString) -> SecretString {
    format!("{}:{}", key.expose_secret(), secret.expose_secret()).into()
}

impl AuthPlacement {
    pub fn name(&self) -> &str {
        match self {
            AuthPlacement::Header { name, .. } | AuthPlacement::Query { name, .. } => name,
        }
    }

    pub fn value(&self) -> &SecretString {
        match self {
            AuthPlacement::Header { value, .. } | AuthPlacement::Query { value, .. } => value,
        }
    }
}
