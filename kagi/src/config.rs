use kagi_oauth2::Authority;
use kagi_tokens::{ClientId, ClientSecret};

use crate::ClientError;

/// The multi-tenant authority of the public cloud
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common/";

/// Configuration for a [`ClientApplication`][crate::ClientApplication]
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The application's client id
    pub client_id: ClientId,
    /// The default authority for requests
    pub authority: Authority,
    /// The default redirect URI, sent exactly as given
    pub redirect_uri: Option<String>,
    /// The client secret, for confidential clients
    pub client_credential: Option<ClientSecret>,
    /// Whether unknown authority hosts must be validated before use
    pub validate_authority: bool,
    /// Whether an access token past its expiry but within its extended
    /// lifetime may be returned when the service is unavailable
    pub extended_lifetime_enabled: bool,
    /// Whether to query the instance discovery endpoint for unknown hosts
    pub instance_discovery: bool,
}

impl ClientConfig {
    /// Configuration for a public client
    pub fn new(client_id: ClientId, authority: Authority) -> Self {
        Self {
            client_id,
            authority,
            redirect_uri: None,
            client_credential: None,
            validate_authority: true,
            extended_lifetime_enabled: false,
            instance_discovery: true,
        }
    }

    /// Sets the redirect URI
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Sets a client secret, making this a confidential client
    pub fn with_client_secret(mut self, secret: ClientSecret) -> Self {
        self.client_credential = Some(secret);
        self
    }

    /// Sets whether unknown authority hosts are validated
    pub fn with_validate_authority(mut self, validate: bool) -> Self {
        self.validate_authority = validate;
        self
    }

    /// Sets whether extended lifetime tokens may be returned
    pub fn with_extended_lifetime(mut self, enabled: bool) -> Self {
        self.extended_lifetime_enabled = enabled;
        self
    }

    /// Sets whether instance discovery is performed
    pub fn with_instance_discovery(mut self, enabled: bool) -> Self {
        self.instance_discovery = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.client_id.as_str().trim().is_empty() {
            return Err(ClientError::MissingClientId);
        }
        Ok(())
    }
}
