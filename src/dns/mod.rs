//! CRUD over Azure DNS zones and record sets.
//!
//! [`Interface`] is the capability the reconciler depends on. [`Client`]
//! speaks the Azure Resource Manager REST protocol; [`MemoryClient`] keeps
//! everything in process and honours the same idempotency and not-found rules,
//! so reconciler tests exercise the real contract without a network.

mod client;
mod memory;
mod types;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::azure::AuthError;

pub use client::{Client, API_VERSION};
pub use memory::MemoryClient;
pub use types::*;

#[derive(Debug, Error)]
pub enum Error {
    /// The service answered with a non-success status.
    #[error("{status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
        target: Option<String>,
    },

    /// The zone holding the targeted record set does not exist.
    #[error("zone {zone} in resource group {resource_group} does not exist (record set {record_type}/{name})")]
    ZoneNotFound {
        resource_group: String,
        zone: String,
        record_type: RecordType,
        name: String,
    },

    #[error("sending request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decoding response body failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("building request url failed: {0}")]
    Url(String),

    #[error("authentication: {0}")]
    Auth(#[from] AuthError),
}

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Server-side failures, throttling and transport errors are transient.
    /// Other 4xx answers describe a caller or configuration problem.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::Transport(_) => true,
            Error::Auth(AuthError::Request(_)) => true,
            Error::Auth(AuthError::Rejected { status, .. }) => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of a read: the status the service answered with, and the
/// resource when it exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup<T> {
    pub status: StatusCode,
    pub value: Option<T>,
}

impl<T> Lookup<T> {
    pub fn found(value: T) -> Self {
        Lookup {
            status: StatusCode::OK,
            value: Some(value),
        }
    }

    pub fn missing(status: StatusCode) -> Self {
        Lookup {
            status,
            value: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.value.is_none()
    }
}

/// Operations over Azure DNS zones and record sets.
///
/// Implementations hold no per-call state and are safe to share between
/// workers. They never retry; the caller decides retry cadence.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Creates the zone or replaces it wholesale.
    async fn create_or_update_zone(&self, resource_group: &str, zone_name: &str, zone: &Zone)
        -> Result<Zone>;

    /// Deletes the zone. Deleting a zone that does not exist succeeds.
    async fn delete_zone(&self, resource_group: &str, zone_name: &str) -> Result<()>;

    /// A missing zone is reported as `204 No Content` or `404 Not Found`.
    async fn get_zone(&self, resource_group: &str, zone_name: &str) -> Result<Lookup<Zone>>;

    /// Lists one page of zones, in the resource group when one is given or
    /// across the subscription otherwise.
    async fn list_zones(
        &self,
        resource_group: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ZoneListResult>;

    /// PUT semantics: the record set ends up exactly as given.
    async fn create_or_update_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
        record_set: &RecordSet,
    ) -> Result<RecordSet>;

    /// Deleting an absent record set succeeds. An absent zone is
    /// [`Error::ZoneNotFound`].
    async fn delete_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<()>;

    async fn get_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<Lookup<RecordSet>>;

    /// Lists one page of record sets, of one type when given.
    async fn list_record_sets(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: Option<RecordType>,
        continuation: Option<&str>,
    ) -> Result<RecordSetListResult>;
}

/// Lists every zone, following continuation links until the last page.
pub async fn list_all_zones(client: &dyn Interface, resource_group: Option<&str>) -> Result<Vec<Zone>> {
    let mut zones = Vec::new();
    let mut page = client.list_zones(resource_group, None).await?;
    loop {
        zones.append(&mut page.value);
        let Some(next) = types::continuation(&page.next_link).map(str::to_owned) else {
            break;
        };
        log::trace!("zone listing was truncated, fetching next page");
        page = client.list_zones(resource_group, Some(&next)).await?;
    }
    Ok(zones)
}

/// Lists every record set in a zone, following continuation links until the
/// last page.
pub async fn list_all_record_sets(
    client: &dyn Interface,
    resource_group: &str,
    zone_name: &str,
    record_type: Option<RecordType>,
) -> Result<Vec<RecordSet>> {
    let mut record_sets = Vec::new();
    let mut page = client
        .list_record_sets(resource_group, zone_name, record_type, None)
        .await?;
    loop {
        record_sets.append(&mut page.value);
        let Some(next) = types::continuation(&page.next_link).map(str::to_owned) else {
            break;
        };
        log::trace!("record set listing for {zone_name} was truncated, fetching next page");
        page = client
            .list_record_sets(resource_group, zone_name, record_type, Some(&next))
            .await?;
    }
    Ok(record_sets)
}
