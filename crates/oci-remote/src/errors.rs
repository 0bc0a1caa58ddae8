//! Errors related to interacting with an OCI compliant remote store

use crate::digest::Digest;
use crate::reference::ParseError;

/// Errors returned by the registry transport and the image accessors.
#[derive(thiserror::Error, Debug)]
pub enum OciDistributionError {
    /// A digest string was not of the form `algorithm:hex`
    #[error("malformed digest {0:?}: {1}")]
    MalformedDigest(String, String),
    /// A manifest body could not be decoded
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    /// A config blob could not be decoded
    #[error("invalid config file: {0}")]
    InvalidConfig(String),
    /// The registry ping or its challenge could not be understood
    #[error("registry authentication handshake failed: {0}")]
    AuthHandshakeFailed(String),
    /// The registry asked for an authentication scheme we do not speak
    #[error("unsupported authentication challenge: {0}")]
    UnsupportedChallenge(String),
    /// The token service refused or mangled a token request
    #[error("bearer token exchange failed: {0}")]
    TokenExchangeFailed(String),
    /// The registry still rejected a request after the token was refreshed
    #[error("authentication failed for {0}")]
    AuthenticationFailure(String),
    /// No layer of the image has the requested diff ID
    #[error("could not find layer by diff ID {0}")]
    LayerNotFound(Digest),
    /// A manifest or blob endpoint answered with a non-success status
    #[error("fetching {url} failed: code={code}, message='{message}'")]
    BlobFetchFailed {
        /// The URL that was requested
        url: String,
        /// The HTTP status code of the response
        code: u16,
        /// The registry error message, if any
        message: String,
    },
    /// Pulled content did not hash to the digest it was requested by
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the content was requested by
        expected: Digest,
        /// The digest of the bytes actually received
        actual: Digest,
    },
    /// The operation is not implemented for this image source
    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),
    /// An image reference could not be parsed
    #[error("invalid reference: {0}")]
    InvalidReference(#[from] ParseError),
    /// Credentials could not be read from the keychain
    #[error("keychain error: {0}")]
    KeychainError(String),
    /// A URL could not be built for a registry request
    #[error("url parse error: {0}")]
    UrlParseError(String),
    /// The underlying HTTP client failed
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
    /// Reading or writing local data failed
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Helper type to declare `Result` objects that might return an `OciDistributionError`
pub type Result<T> = std::result::Result<T, OciDistributionError>;

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {}
impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error: {}", self.message.as_str())
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct OciEnvelope {
    pub(crate) errors: Vec<OciError>,
}

impl OciEnvelope {
    /// Pulls the first registry error message out of a response body, falling
    /// back to the raw body when it is not an error envelope.
    pub(crate) fn message_from_body(body: &str) -> String {
        match serde_json::from_str::<OciEnvelope>(body) {
            Ok(envelope) => envelope
                .errors
                .into_iter()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            Err(_) => body.trim().to_string(),
        }
    }
}

/// OCI error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    ///
    /// This error MAY be returned when a blob is unknown to the registry in a specified
    /// repository. This can be returned with a standard get or if a manifest
    /// references an unknown layer during upload.
    BlobUnknown,
    /// Blob upload is invalid
    ///
    /// The blob upload encountered an error and can no longer proceed.
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ///
    /// During upload, manifests undergo several checks ensuring validity. If
    /// those checks fail, this error MAY be returned, unless a more specific
    /// error is included. The detail will contain information the failed
    /// validation.
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Manifest failed signature validation
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    ManifestUnverified,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    TagInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
    /// A code this client does not know, such as a registry-specific one
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_ERROR: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","message":"authentication required","detail":[{"Type":"repository","Name":"hello-wasm","Action":"pull"}]}]}
      "#;
    #[test]
    fn test_deserialize() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!("authentication required", e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    #[test]
    fn test_deserialize_unknown_code() {
        let envelope: OciEnvelope = serde_json::from_str(
            r#"{"errors":[{"code":"QUOTA_EXCEEDED","message":"quota exceeded"}]}"#,
        )
        .expect("parse error with unknown code");
        assert_eq!(OciErrorCode::Unknown, envelope.errors[0].code);
        assert_eq!("quota exceeded", envelope.errors[0].message);
    }

    const EXAMPLE_ERROR_TOOMANYREQUESTS: &str = r#"
      {"errors":[{"code":"TOOMANYREQUESTS","message":"pull request limit exceeded","detail":"You have reached your pull rate limit."}]}
      "#;
    #[test]
    fn test_deserialize_toomanyrequests() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_TOOMANYREQUESTS).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Toomanyrequests, e.code);
        assert_eq!("pull request limit exceeded", e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_MISSING_MESSAGE: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","detail":[{"Type":"repository","Name":"hello-wasm","Action":"pull"}]}]}
      "#;
    #[test]
    fn test_deserialize_without_message_field() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_MESSAGE).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!(String::default(), e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_MISSING_DETAIL: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}
      "#;
    #[test]
    fn test_deserialize_without_detail_field() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_DETAIL).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!("authentication required", e.message);
        assert_eq!(serde_json::value::Value::Null, e.detail);
    }

    #[test]
    fn test_message_from_body() {
        assert_eq!(
            "OCI API error: authentication required",
            OciEnvelope::message_from_body(EXAMPLE_ERROR_MISSING_DETAIL)
        );
        assert_eq!("not json", OciEnvelope::message_from_body("not json\n"));
        assert_eq!(
            "OCI API error: quota exceeded for repository",
            OciEnvelope::message_from_body(
                r#"{"errors":[{"code":"QUOTA_EXCEEDED","message":"quota exceeded for repository"}]}"#
            )
        );
        assert_eq!("", OciEnvelope::message_from_body(r#"{"errors":[]}"#));
    }

    #[test]
    fn test_fetch_failed_display() {
        let err = OciDistributionError::BlobFetchFailed {
            url: "https://example.com/v2/foo/blobs/sha256:ab".to_string(),
            code: 404,
            message: "OCI API error: blob unknown".to_string(),
        };
        assert_eq!(
            "fetching https://example.com/v2/foo/blobs/sha256:ab failed: code=404, message='OCI API error: blob unknown'",
            err.to_string()
        );
    }
}
