//! Images served by a registry
//!
//! Every accessor maps to one or more registry requests sent through the
//! session's authenticating [`Transport`]:
//!
//! - manifests: `GET /v2/{repository}/manifests/{identifier}`
//! - blobs: `GET` or `HEAD /v2/{repository}/blobs/{digest}`

use crate::client::ClientProtocol;
use crate::digest::Digest;
use crate::errors::{OciDistributionError, OciEnvelope, Result};
use crate::image::{BlobStream, Image};
use crate::manifest::SUPPORTED_MANIFEST_MEDIA_TYPES;
use crate::reference::Reference;
use crate::secrets::RegistryAuth;
use crate::transport::{self, RegistryOperation, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_LENGTH};
use reqwest::{Method, Request, Response, Url};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// An image in a registry, accessed through an authenticated session.
///
/// Nothing is cached: each accessor re-fetches what it needs.
#[derive(Clone)]
pub struct RemoteImage {
    reference: Reference,
    protocol: ClientProtocol,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RemoteImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteImage")
            .field("reference", &self.reference)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl RemoteImage {
    /// Authenticates against the registry hosting `reference` over `inner`
    /// and returns the image.
    pub async fn new<T: Transport + 'static>(
        reference: Reference,
        auth: &RegistryAuth,
        inner: T,
        protocol: ClientProtocol,
    ) -> Result<Self> {
        let transport =
            transport::new(&reference, auth, inner, RegistryOperation::Pull, &protocol).await?;
        Ok(Self::with_transport(reference, transport, protocol))
    }

    /// An image reached through an already authenticated transport.
    pub fn with_transport(
        reference: Reference,
        transport: Arc<dyn Transport>,
        protocol: ClientProtocol,
    ) -> Self {
        RemoteImage {
            reference,
            protocol,
            transport,
        }
    }

    /// The reference this image was opened by.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Sends `request` and turns any non-success status into
    /// [`OciDistributionError::BlobFetchFailed`].
    async fn fetch(&self, request: Request) -> Result<Response> {
        let url = request.url().to_string();
        trace!(method = %request.method(), %url, "Registry request");
        let res = self.transport.round_trip(request).await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let body = match res.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(%url, error = %e, "Failed to read error response body");
                String::new()
            }
        };
        debug!(%url, %status, "Registry request failed");
        Err(OciDistributionError::BlobFetchFailed {
            url,
            code: status.as_u16(),
            message: OciEnvelope::message_from_body(&body),
        })
    }

    fn blob_request(&self, method: Method, digest: &Digest) -> Result<Request> {
        let url = to_v2_blob_url(&self.protocol, &self.reference, digest);
        Ok(Request::new(method, parse_url(&url)?))
    }
}

#[async_trait]
impl Image for RemoteImage {
    async fn raw_manifest(&self) -> Result<Bytes> {
        let url = to_v2_manifest_url(&self.protocol, &self.reference);
        let mut request = Request::new(Method::GET, parse_url(&url)?);
        let accept = HeaderValue::from_str(&SUPPORTED_MANIFEST_MEDIA_TYPES.join(", "))
            .map_err(|e| OciDistributionError::UrlParseError(e.to_string()))?;
        request.headers_mut().insert(ACCEPT, accept);

        let res = self.fetch(request).await?;
        let body = res.bytes().await?;
        debug!(reference = %self.reference, bytes = body.len(), "Fetched manifest");
        Ok(body)
    }

    async fn blob_size(&self, digest: &Digest) -> Result<u64> {
        let request = self.blob_request(Method::HEAD, digest)?;
        let url = request.url().to_string();
        let res = self.fetch(request).await?;
        // The length of a HEAD response is only in its header.
        res.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| OciDistributionError::BlobFetchFailed {
                url,
                code: res.status().as_u16(),
                message: "response has no valid Content-Length".to_string(),
            })
    }

    async fn blob(&self, digest: &Digest) -> Result<BlobStream> {
        let res = self.fetch(self.blob_request(Method::GET, digest)?).await?;
        debug!(%digest, size = ?res.content_length(), "Streaming blob");
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map_err(OciDistributionError::from))
            .boxed())
    }

    async fn uncompressed_blob(&self, _digest: &Digest) -> Result<BlobStream> {
        Err(OciDistributionError::UnsupportedOperation(
            "uncompressed blobs are not available from a remote image".to_string(),
        ))
    }

    async fn uncompressed_layer(&self, _diff_id: &Digest) -> Result<BlobStream> {
        Err(OciDistributionError::UnsupportedOperation(
            "uncompressed layers are not available from a remote image".to_string(),
        ))
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| OciDistributionError::UrlParseError(format!("{}: {}", url, e)))
}

/// Convert a Reference to a v2 manifest URL.
fn to_v2_manifest_url(protocol: &ClientProtocol, reference: &Reference) -> String {
    let registry = reference.resolve_registry();
    format!(
        "{}://{}/v2/{}/manifests/{}",
        protocol.scheme_for(registry),
        registry,
        reference.repository(),
        reference.identifier(),
    )
}

/// Convert a Reference and a digest to a v2 blob URL.
fn to_v2_blob_url(protocol: &ClientProtocol, reference: &Reference, digest: &Digest) -> String {
    let registry = reference.resolve_registry();
    format!(
        "{}://{}/v2/{}/blobs/{}",
        protocol.scheme_for(registry),
        registry,
        reference.repository(),
        digest,
    )
}
