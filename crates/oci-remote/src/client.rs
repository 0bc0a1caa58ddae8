//! Registry client configuration
//!
//! A [`Client`] owns the HTTP connection pool and the settings shared by
//! every registry session it opens. Each call to [`Client::image`] performs
//! its own authentication handshake, so credentials and tokens never leak
//! between images.

use crate::errors::{OciDistributionError, Result};
use crate::reference::Reference;
use crate::remote::RemoteImage;
use crate::secrets::{Keychain, RegistryAuth};
use std::convert::TryFrom;
use std::time::Duration;
use tracing::{debug, warn};

/// The client for a registry, used to open remote images.
///
/// ```no_run
/// use oci_remote::{Client, Image, Reference, secrets::RegistryAuth};
///
/// # async fn run() -> oci_remote::errors::Result<()> {
/// let reference: Reference = "ghcr.io/example/app:v1".parse()?;
/// let image = Client::default().image(&reference, &RegistryAuth::Anonymous).await?;
/// println!("{}", image.digest().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Client {
    config: ClientConfig,
    client: reqwest::Client,
}

/// A source that can provide a `ClientConfig`.
/// If you are using this crate in your own application, you can implement this
/// trait on your configuration type so that it can be passed to `Client::from_source`.
pub trait ClientConfigSource {
    /// Provides a `ClientConfig`.
    fn client_config(&self) -> ClientConfig;
}

impl TryFrom<ClientConfig> for Client {
    type Error = OciDistributionError;

    fn try_from(config: ClientConfig) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);
        if let Some(timeout) = config.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        Ok(Self {
            config,
            client: client_builder.build()?,
        })
    }
}

impl Client {
    /// Create a new client with the supplied config
    pub fn new(config: ClientConfig) -> Self {
        Client::try_from(config.clone()).unwrap_or_else(|err| {
            warn!("Cannot create OCI client from config: {:?}", err);
            warn!("Creating client with default configuration");
            Self {
                config,
                client: reqwest::Client::new(),
            }
        })
    }

    /// Create a new client with the supplied config
    pub fn from_source(config_source: &impl ClientConfigSource) -> Self {
        Self::new(config_source.client_config())
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens the image at `reference` for pulling, authenticating with `auth`.
    ///
    /// The registry handshake happens here; a registry that rejects the
    /// credentials or speaks an unknown scheme fails before any content is
    /// requested.
    pub async fn image(&self, reference: &Reference, auth: &RegistryAuth) -> Result<RemoteImage> {
        debug!(reference = %reference, "Opening remote image");
        RemoteImage::new(
            reference.clone(),
            auth,
            self.client.clone(),
            self.config.protocol.clone(),
        )
        .await
    }

    /// Opens the image at `reference`, looking its registry's credentials up
    /// in `keychain`.
    pub async fn image_with_keychain(
        &self,
        reference: &Reference,
        keychain: &dyn Keychain,
    ) -> Result<RemoteImage> {
        let auth = keychain.resolve(reference.resolve_registry())?;
        self.image(reference, &auth).await
    }
}

/// A client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// Total time allowed for each request, including reading the body.
    /// Defaults to no limit
    pub timeout: Option<Duration>,
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    /// HTTPS for every registry but the listed hosts
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    pub(crate) fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}
