use thiserror::Error;

use crate::dns;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Controller options failed validation. Fatal at startup.
    #[error("invalid options: {0}")]
    Options(&'static str),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Optimistic concurrency failure while writing a cluster object.
    #[error("conflict updating {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("dns: {0}")]
    Dns(#[from] dns::Error),

    #[error("waiting for {0} cache to sync failed")]
    CacheSync(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the failed operation may succeed if repeated unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Dns(error) => error.is_transient(),
            Error::Kube(kube::Error::Api(response)) => response.code >= 500 || response.code == 429,
            Error::Kube(_) | Error::Conflict { .. } | Error::CacheSync(_) => true,
            Error::Options(_) | Error::NotFound { .. } => false,
        }
    }
}
