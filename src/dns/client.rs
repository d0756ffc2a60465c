use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::{
    CloudError, Error, Interface, Lookup, RecordSet, RecordSetListResult, RecordType, Result,
    Zone, ZoneListResult,
};
use crate::azure::{Authentication, ServicePrincipalCredential, TokenCredential};

pub const API_VERSION: &str = "2018-03-01-preview";

const USER_AGENT: &str = concat!("aks-dns-ingress/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Azure DNS over the Resource Manager REST API.
///
/// Clients should be reused rather than created per call; the only state is
/// the HTTP connection pool and the cached bearer token.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
    subscription_id: String,
    credential: Arc<dyn TokenCredential>,
}

impl Client {
    /// Builds a client that authenticates as the service principal in `auth`.
    pub fn new(auth: &Authentication) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let credential = Arc::new(ServicePrincipalCredential::new(http.clone(), auth));

        Self::with_credential(
            http,
            auth.resource_manager_endpoint(),
            &auth.subscription_id,
            credential,
        )
    }

    pub fn with_credential(
        http: reqwest::Client,
        base_url: &str,
        subscription_id: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|err| Error::Url(format!("invalid base url {base_url:?}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Url(format!("{base_url:?} cannot be a base url")));
        }

        Ok(Client {
            http,
            base,
            subscription_id: subscription_id.to_owned(),
            credential,
        })
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["subscriptions", self.subscription_id.as_str()])
                .extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        url
    }

    fn zones_url(&self, resource_group: Option<&str>) -> Url {
        match resource_group {
            Some(resource_group) => self.url([
                "resourceGroups",
                resource_group,
                "providers",
                "Microsoft.Network",
                "dnsZones",
            ]),
            None => self.url(["providers", "Microsoft.Network", "dnsZones"]),
        }
    }

    fn zone_url<'a>(
        &self,
        resource_group: &'a str,
        zone_name: &'a str,
        rest: impl IntoIterator<Item = &'a str>,
    ) -> Url {
        self.url(
            [
                "resourceGroups",
                resource_group,
                "providers",
                "Microsoft.Network",
                "dnsZones",
                zone_name,
            ]
            .into_iter()
            .chain(rest),
        )
    }

    fn continuation_url(&self, link: &str) -> Result<Url> {
        Url::parse(link).map_err(|err| Error::Url(format!("invalid continuation link {link:?}: {err}")))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.credential.token().await?;
        let response = request.bearer_auth(token).send().await?;
        trace!(
            "{} responded {}",
            response.url().path(),
            response.status().as_u16()
        );
        Ok(response)
    }

    async fn request(&self, method: Method, url: Url) -> Result<Response> {
        debug!("{method} {}", url.path());
        self.send(self.http.request(method, url)).await
    }

    async fn put<T: serde::Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<Response> {
        debug!("PUT {}", url.path());
        self.send(self.http.put(url).json(body)).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Maps a non-success response onto [`Error::Api`], decoding the cloud error
/// envelope when the body carries one.
async fn api_error(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match serde_json::from_str::<CloudError>(&body) {
        Ok(CloudError { error }) if !error.code.is_empty() => Error::Api {
            status,
            code: error.code,
            message: error.message,
            target: error.target,
        },
        _ => Error::Api {
            status,
            code: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .replace(' ', ""),
            message: body,
            target: None,
        },
    }
}

#[async_trait]
impl Interface for Client {
    async fn create_or_update_zone(
        &self,
        resource_group: &str,
        zone_name: &str,
        zone: &Zone,
    ) -> Result<Zone> {
        let response = self.put(self.zone_url(resource_group, zone_name, []), zone).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => decode(response).await,
            _ => Err(api_error(response).await),
        }
    }

    async fn delete_zone(&self, resource_group: &str, zone_name: &str) -> Result<()> {
        let url = self.zone_url(resource_group, zone_name, []);
        let response = self.request(Method::DELETE, url).await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("zone {zone_name} in {resource_group} already absent");
                Ok(())
            }
            _ => Err(api_error(response).await),
        }
    }

    async fn get_zone(&self, resource_group: &str, zone_name: &str) -> Result<Lookup<Zone>> {
        let url = self.zone_url(resource_group, zone_name, []);
        let response = self.request(Method::GET, url).await?;
        match response.status() {
            StatusCode::OK => Ok(Lookup::found(decode(response).await?)),
            // Zones answer 204 rather than 404 when they do not exist.
            status @ (StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) => Ok(Lookup::missing(status)),
            _ => Err(api_error(response).await),
        }
    }

    async fn list_zones(
        &self,
        resource_group: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ZoneListResult> {
        let url = match continuation {
            Some(link) => self.continuation_url(link)?,
            None => self.zones_url(resource_group),
        };
        let response = self.request(Method::GET, url).await?;
        match response.status() {
            StatusCode::OK => decode(response).await,
            _ => Err(api_error(response).await),
        }
    }

    async fn create_or_update_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
        record_set: &RecordSet,
    ) -> Result<RecordSet> {
        let url = self.zone_url(resource_group, zone_name, [record_type.as_str(), relative_name]);
        let response = self.put(url, record_set).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => decode(response).await,
            _ => Err(api_error(response).await),
        }
    }

    async fn delete_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<()> {
        let url = self.zone_url(resource_group, zone_name, [record_type.as_str(), relative_name]);
        let response = self.request(Method::DELETE, url).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => match api_error(response).await {
                Error::Api { code, .. } if code == "ParentResourceNotFound" => {
                    Err(Error::ZoneNotFound {
                        resource_group: resource_group.to_owned(),
                        zone: zone_name.to_owned(),
                        record_type,
                        name: relative_name.to_owned(),
                    })
                }
                _ => {
                    debug!("record set {record_type}/{relative_name} in {zone_name} already absent");
                    Ok(())
                }
            },
            _ => Err(api_error(response).await),
        }
    }

    async fn get_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<Lookup<RecordSet>> {
        let url = self.zone_url(resource_group, zone_name, [record_type.as_str(), relative_name]);
        let response = self.request(Method::GET, url).await?;
        match response.status() {
            StatusCode::OK => Ok(Lookup::found(decode(response).await?)),
            StatusCode::NOT_FOUND => Ok(Lookup::missing(StatusCode::NOT_FOUND)),
            _ => Err(api_error(response).await),
        }
    }

    async fn list_record_sets(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: Option<RecordType>,
        continuation: Option<&str>,
    ) -> Result<RecordSetListResult> {
        let url = match (continuation, record_type) {
            (Some(link), _) => self.continuation_url(link)?,
            (None, Some(record_type)) => {
                self.zone_url(resource_group, zone_name, [record_type.as_str()])
            }
            (None, None) => self.zone_url(resource_group, zone_name, ["recordsets"]),
        };
        let response = self.request(Method::GET, url).await?;
        match response.status() {
            StatusCode::OK => decode(response).await,
            _ => Err(api_error(response).await),
        }
    }
}
