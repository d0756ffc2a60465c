//! Azure service principal credentials and the bearer tokens derived from them.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_ACTIVE_DIRECTORY_ENDPOINT: &str = "https://login.microsoftonline.com/";
pub const DEFAULT_RESOURCE_MANAGER_ENDPOINT: &str = "https://management.azure.com/";

// Tokens are refreshed this long before the expiry the directory reported.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("azure config was specified as {0:?} but does not exist")]
    Missing(PathBuf),

    #[error("reading authentication file {path:?} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("decoding authentication file {path:?} failed: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("parsing authentication file {path:?} failed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("azure credentials are incomplete: {0} is not set")]
    Incomplete(&'static str),

    #[error("requesting token failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// The contents of an Azure SDK auth file (`az ad sp create-for-rbac --sdk-auth`).
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    #[serde(
        default,
        rename = "activeDirectoryEndpointUrl",
        skip_serializing_if = "String::is_empty"
    )]
    pub active_directory_endpoint: String,
    #[serde(
        default,
        rename = "resourceManagerEndpointUrl",
        skip_serializing_if = "String::is_empty"
    )]
    pub resource_manager_endpoint: String,
    #[serde(
        default,
        rename = "activeDirectoryGraphResourceId",
        skip_serializing_if = "String::is_empty"
    )]
    pub graph_resource_id: String,
    #[serde(
        default,
        rename = "managementEndpointUrl",
        skip_serializing_if = "String::is_empty"
    )]
    pub management_endpoint: String,
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authentication")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<REDACTED>")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("active_directory_endpoint", &self.active_directory_endpoint)
            .field("resource_manager_endpoint", &self.resource_manager_endpoint)
            .finish()
    }
}

impl Authentication {
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let bytes = std::fs::read(path).map_err(|source| AuthError::Read {
            path: path.to_owned(),
            source,
        })?;

        // az cli on windows writes these files as UTF-16.
        let text = decode(&bytes).map_err(|message| AuthError::Decode {
            path: path.to_owned(),
            message,
        })?;

        serde_json::from_str(&text).map_err(|source| AuthError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        Authentication {
            client_id: var("AZURE_CLIENT_ID"),
            client_secret: var("AZURE_CLIENT_SECRET"),
            tenant_id: var("AZURE_TENANT_ID"),
            subscription_id: var("AZURE_SUBSCRIPTION_ID"),
            ..Default::default()
        }
    }

    /// Loads credentials from `config` when given, falling back to the
    /// `AZURE_*` environment variables otherwise.
    pub fn load(config: Option<&Path>) -> Result<Self, AuthError> {
        match config {
            Some(path) if !path.exists() => Err(AuthError::Missing(path.to_owned())),
            Some(path) => Self::from_file(path),
            None => Ok(Self::from_env()),
        }
    }

    /// Rejects credentials a token cannot be requested with.
    pub fn validate(&self) -> Result<(), AuthError> {
        let required = [
            ("client id", &self.client_id),
            ("client secret", &self.client_secret),
            ("tenant id", &self.tenant_id),
            ("subscription id", &self.subscription_id),
        ];
        match required.into_iter().find(|(_, value)| value.is_empty()) {
            Some((field, _)) => Err(AuthError::Incomplete(field)),
            None => Ok(()),
        }
    }

    pub fn active_directory_endpoint(&self) -> &str {
        non_empty_or(&self.active_directory_endpoint, DEFAULT_ACTIVE_DIRECTORY_ENDPOINT)
    }

    pub fn resource_manager_endpoint(&self) -> &str {
        non_empty_or(&self.resource_manager_endpoint, DEFAULT_RESOURCE_MANAGER_ENDPOINT)
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn decode(bytes: &[u8]) -> Result<String, String> {
    fn utf16(body: &[u8], from_bytes: fn([u8; 2]) -> u16) -> Result<String, String> {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| from_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|err| err.to_string())
    }

    match bytes {
        [0xFF, 0xFE, body @ ..] => utf16(body, u16::from_le_bytes),
        [0xFE, 0xFF, body @ ..] => utf16(body, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, body @ ..] => {
            String::from_utf8(body.to_vec()).map_err(|err| err.to_string())
        }
        body => String::from_utf8(body.to_vec()).map_err(|err| err.to_string()),
    }
}

/// Source of bearer tokens for Azure Resource Manager requests.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// A fixed token, for tests and for tokens minted out of band.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenCredential for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "seconds_from_str_or_number")]
    expires_in: u64,
}

fn seconds_from_str_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials flow against the Azure AD v1 token endpoint.
///
/// The token is cached and shared by every caller until it nears expiry.
pub struct ServicePrincipalCredential {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    resource: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ServicePrincipalCredential {
    pub fn new(http: reqwest::Client, auth: &Authentication) -> Self {
        let directory = auth.active_directory_endpoint().trim_end_matches('/');
        ServicePrincipalCredential {
            http,
            token_url: format!("{directory}/{tenant}/oauth2/token", tenant = auth.tenant_id),
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            resource: auth.resource_manager_endpoint().to_owned(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        debug!("requesting service principal token from {}", self.token_url);

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("resource", self.resource.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_SLACK);
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenCredential for ServicePrincipalCredential {
    async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                trace!("reusing cached service principal token");
                return Ok(token.access_token.clone());
            }
        }

        let token = self.fetch().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }
}
