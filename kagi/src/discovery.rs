//! Instance discovery for authority hosts
//!
//! Hosts of the well-known clouds are resolved from a static table. Other
//! hosts are checked against the instance discovery endpoint once, and the
//! answer is kept for the life of the [`InstanceDiscovery`].

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use kagi_oauth2::{
    authority::known_instance_metadata, Authority, AuthorityError, AuthorityKind, InstanceMetadata,
    ResolvedAuthority,
};
use kagi_tokens::{
    exchange::ErrorResponse,
    transport::{HttpRequest, HttpTransport},
};
use serde::Deserialize;
use url::Url;

use crate::{error::INVALID_RESPONSE, AuthError, ClientError, ServiceError};

/// The endpoint queried for hosts that are not well known
pub const DISCOVERY_ENDPOINT: &str = "https://login.microsoftonline.com/common/discovery/instance";

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    tenant_discovery_endpoint: Option<String>,
    #[serde(default)]
    metadata: Vec<MetadataDto>,
}

#[derive(Debug, Deserialize)]
struct MetadataDto {
    preferred_network: String,
    preferred_cache: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Whether and how unknown hosts are checked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Reject hosts that the discovery endpoint does not recognize
    pub validate_authority: bool,
    /// Query the discovery endpoint at all
    pub instance_discovery: bool,
}

/// A per-host cache of instance metadata
#[derive(Debug, Default)]
pub struct InstanceDiscovery {
    known: ArcSwap<HashMap<String, InstanceMetadata>>,
}

impl InstanceDiscovery {
    /// Constructs an empty discovery cache
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, host: &str) -> Option<InstanceMetadata> {
        self.known.load().get(host).cloned()
    }

    fn remember(&self, metadata: &InstanceMetadata) {
        self.known.rcu(|current| {
            let mut next = HashMap::clone(current);
            for alias in &metadata.aliases {
                next.insert(alias.to_ascii_lowercase(), metadata.clone());
            }
            next
        });
    }

    /// Resolves the metadata for an authority's host
    #[tracing::instrument(err, skip_all, fields(authority = %authority))]
    pub async fn resolve<T: HttpTransport + ?Sized>(
        &self,
        authority: &Authority,
        transport: &T,
        options: DiscoveryOptions,
        correlation_id: &str,
    ) -> Result<ResolvedAuthority, AuthError> {
        let host = authority.host().to_ascii_lowercase();

        if let Some(metadata) = self.cached(&host) {
            return Ok(ResolvedAuthority::new(authority.clone(), metadata));
        }

        if let Some(metadata) = known_instance_metadata(&host) {
            return Ok(ResolvedAuthority::new(authority.clone(), metadata));
        }

        let discoverable = matches!(authority.kind(), AuthorityKind::Aad { .. });
        let metadata = if discoverable && options.validate_authority && options.instance_discovery {
            self.discover(authority, &host, transport, correlation_id).await?
        } else {
            tracing::debug!(host = %host, "treating authority host as its own only alias");
            InstanceMetadata::self_aliased(&host)
        };

        self.remember(&metadata);
        Ok(ResolvedAuthority::new(authority.clone(), metadata))
    }

    async fn discover<T: HttpTransport + ?Sized>(
        &self,
        authority: &Authority,
        host: &str,
        transport: &T,
        correlation_id: &str,
    ) -> Result<InstanceMetadata, AuthError> {
        let mut url = Url::parse(DISCOVERY_ENDPOINT).map_err(AuthorityError::from).map_err(ClientError::from)?;
        url.query_pairs_mut()
            .append_pair("api-version", "1.1")
            .append_pair("authorization_endpoint", authority.authorization_endpoint().as_str());

        let req = HttpRequest::get(url)
            .with_header("client-request-id", correlation_id)
            .with_header("return-client-request-id", "true");
        let resp = transport
            .send(req)
            .await
            .map_err(ServiceError::from_transport)?;

        if !resp.is_success() {
            let err: ErrorResponse = serde_json::from_slice(&resp.body).unwrap_or_default();

            if err.error == "invalid_instance" {
                tracing::warn!(host = %host, "authority host is not a trusted instance");
                return Err(ClientError::InvalidAuthority(AuthorityError::NotTrusted(host.to_owned())).into());
            }

            let mut service = ServiceError::without_response(
                if err.error.is_empty() { INVALID_RESPONSE.to_owned() } else { err.error },
                err.error_description.unwrap_or_default(),
            );
            service.status = Some(resp.status);
            service.error_codes = err.error_codes;
            service.correlation_id = Some(correlation_id.to_owned());
            return Err(service.into());
        }

        let body: DiscoveryResponse = serde_json::from_slice(&resp.body).map_err(|e| {
            let mut service = ServiceError::without_response(INVALID_RESPONSE, "instance discovery response could not be parsed");
            service.status = Some(resp.status);
            service.source = Some(Box::new(e));
            service
        })?;

        if body.tenant_discovery_endpoint.is_none() {
            return Err(ClientError::InvalidAuthority(AuthorityError::NotTrusted(host.to_owned())).into());
        }

        let metadata = body
            .metadata
            .into_iter()
            .find(|m| m.aliases.iter().any(|a| a.eq_ignore_ascii_case(host)))
            .map(|m| InstanceMetadata {
                preferred_network: m.preferred_network.to_ascii_lowercase(),
                preferred_cache: m.preferred_cache.to_ascii_lowercase(),
                aliases: m.aliases.iter().map(|a| a.to_ascii_lowercase()).collect(),
            })
            .unwrap_or_else(|| InstanceMetadata::self_aliased(host));

        tracing::info!(
            host = %host,
            preferred_network = %metadata.preferred_network,
            preferred_cache = %metadata.preferred_cache,
            "discovered authority instance"
        );
        Ok(metadata)
    }

    /// Drops all discovered metadata
    pub fn clear(&self) {
        self.known.store(Arc::new(HashMap::new()));
    }
}
