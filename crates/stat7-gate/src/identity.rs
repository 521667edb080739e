use std::collections::BTreeSet;
use std::io;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// A verified caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Digest of the token this identity was verified from, when the provider holds a token table.
    #[serde(skip)]
    pub token_sha256: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("auth token is missing")]
    MissingToken,
    #[error("auth token is not recognised")]
    InvalidToken,
    #[error("auth token expired")]
    Expired,
    #[error("identity service timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// External identity collaborator. Implementations must bound every call in time.
pub trait IdentityProvider: Send + Sync {
    /// # Errors
    /// Returns `IdentityError` for missing, unknown or expired tokens and for service failures.
    fn verify(&self, auth_token: &str) -> Result<Identity, IdentityError>;

    /// Checks a second-factor code for an already verified identity.
    ///
    /// # Errors
    /// Returns `IdentityError` when the check itself could not be performed.
    fn verify_second_factor(&self, identity: &Identity, code: &str) -> Result<bool, IdentityError>;
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Token table entry. Tokens and codes are held only as SHA-256 digests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StaticIdentity {
    pub token_sha256: String,
    pub subject: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_factor_sha256: Option<String>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(
        token: &str,
        subject: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            token_sha256: sha256_hex(token),
            subject: subject.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            expires_at: None,
            second_factor_sha256: None,
        }
    }

    #[must_use]
    pub fn expiring_at(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_second_factor(mut self, code: &str) -> Self {
        self.second_factor_sha256 = Some(sha256_hex(code));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    identities: Vec<StaticIdentity>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new(identities: Vec<StaticIdentity>) -> Self {
        Self { identities }
    }

    fn entry_for_digest(&self, digest: &str) -> Option<&StaticIdentity> {
        self.identities
            .iter()
            .find(|entry| entry.token_sha256.eq_ignore_ascii_case(digest))
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn verify(&self, auth_token: &str) -> Result<Identity, IdentityError> {
        if auth_token.is_empty() {
            return Err(IdentityError::MissingToken);
        }
        let digest = sha256_hex(auth_token);
        let entry = self
            .entry_for_digest(&digest)
            .ok_or(IdentityError::InvalidToken)?;
        if entry
            .expires_at
            .is_some_and(|expires_at| expires_at <= OffsetDateTime::now_utc())
        {
            return Err(IdentityError::Expired);
        }
        Ok(Identity {
            subject: entry.subject.clone(),
            roles: entry.roles.clone(),
            token_sha256: Some(digest),
        })
    }

    fn verify_second_factor(&self, identity: &Identity, code: &str) -> Result<bool, IdentityError> {
        Ok(identity
            .token_sha256
            .as_deref()
            .and_then(|digest| self.entry_for_digest(digest))
            .and_then(|entry| entry.second_factor_sha256.as_deref())
            .is_some_and(|expected| expected.eq_ignore_ascii_case(&sha256_hex(code))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpIdentityConfig {
    pub verify_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_factor_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    subject: String,
    #[serde(default)]
    roles: BTreeSet<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct SecondFactorResponse {
    verified: bool,
}

enum Attempt<T> {
    Done(Result<T, IdentityError>),
    Retryable(IdentityError),
}

/// Identity service reached over HTTP with a per-call timeout. A transport
/// failure is retried once after `retry_backoff`.
pub struct HttpIdentityProvider {
    agent: ureq::Agent,
    config: HttpIdentityConfig,
    retry_backoff: Duration,
}

impl HttpIdentityProvider {
    #[must_use]
    pub fn new(config: HttpIdentityConfig, timeout: Duration, retry_backoff: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            config,
            retry_backoff,
        }
    }

    fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, IdentityError> {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match self.attempt(url, body) {
                Attempt::Done(result) => return result,
                Attempt::Retryable(err) if attempts < 2 => {
                    tracing::warn!(attempts, error = %err, "identity service call failed, retrying");
                    thread::sleep(self.retry_backoff);
                }
                Attempt::Retryable(IdentityError::Timeout { .. }) => {
                    return Err(IdentityError::Timeout { attempts });
                }
                Attempt::Retryable(err) => return Err(err),
            }
        }
    }

    fn attempt<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Attempt<T> {
        match self.agent.post(url).send_json(body) {
            Ok(response) => Attempt::Done(response.into_json::<T>().map_err(|err| {
                IdentityError::Unavailable(format!("invalid identity service response: {err}"))
            })),
            Err(ureq::Error::Status(401 | 403 | 404, _)) => {
                Attempt::Done(Err(IdentityError::InvalidToken))
            }
            Err(ureq::Error::Status(code, _)) => Attempt::Done(Err(IdentityError::Unavailable(
                format!("identity service returned status {code}"),
            ))),
            Err(ureq::Error::Transport(transport)) => {
                if is_timeout(&transport) {
                    Attempt::Retryable(IdentityError::Timeout { attempts: 1 })
                } else {
                    Attempt::Retryable(IdentityError::Unavailable(transport.to_string()))
                }
            }
        }
    }
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    let io_timeout = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|err| matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock));
    io_timeout || transport.to_string().to_ascii_lowercase().contains("timed out")
}

impl IdentityProvider for HttpIdentityProvider {
    fn verify(&self, auth_token: &str) -> Result<Identity, IdentityError> {
        if auth_token.is_empty() {
            return Err(IdentityError::MissingToken);
        }
        let response: VerifyResponse = self.post_json(
            &self.config.verify_url,
            &serde_json::json!({ "token": auth_token }),
        )?;
        if response
            .expires_at
            .is_some_and(|expires_at| expires_at <= OffsetDateTime::now_utc())
        {
            return Err(IdentityError::Expired);
        }
        Ok(Identity {
            subject: response.subject,
            roles: response.roles,
            token_sha256: None,
        })
    }

    fn verify_second_factor(&self, identity: &Identity, code: &str) -> Result<bool, IdentityError> {
        let Some(url) = self.config.second_factor_url.as_deref() else {
            return Ok(false);
        };
        let response: SecondFactorResponse = self.post_json(
            url,
            &serde_json::json!({ "subject": identity.subject, "code": code }),
        )?;
        Ok(response.verified)
    }
}

/// Which identity provider to build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum IdentityConfig {
    Static {
        #[serde(default)]
        identities: Vec<StaticIdentity>,
    },
    Http(HttpIdentityConfig),
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::Static {
            identities: Vec::new(),
        }
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn build(&self, timeout: Duration, retry_backoff: Duration) -> Box<dyn IdentityProvider> {
        match self {
            Self::Static { identities } => Box::new(StaticIdentityProvider::new(identities.clone())),
            Self::Http(config) => {
                Box::new(HttpIdentityProvider::new(config.clone(), timeout, retry_backoff))
            }
        }
    }
}
