//! Registry authentication transport
//!
//! Before any content request, the registry is pinged at `/v2/` and its
//! answer decides how every later request is authenticated:
//!
//! - `200`: the registry is open, requests go out untouched.
//! - `401` with a `Basic` challenge: every request carries the caller's
//!   credentials.
//! - `401` with a `Bearer` challenge: credentials are exchanged at the
//!   challenge's `realm` for a token, which every request carries. A `401`
//!   on a request triggers one re-exchange and one retry.
//!
//! The result is a [`Transport`] that the image accessors use as if the
//! registry needed no authentication at all.

use crate::client::ClientProtocol;
use crate::errors::{OciDistributionError, Result};
use crate::reference::Reference;
use crate::secrets::{Authenticable, RegistryAuth};
use async_trait::async_trait;
use hyperx::header::Header;
use reqwest::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Request, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use www_authenticate::{Challenge as _, ChallengeFields, RawChallenge, WwwAuthenticate};

/// Desired operation for registry authentication
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistryOperation {
    /// Authenticate for push operations
    Push,
    /// Authenticate for pull operations
    Pull,
}

/// A request/response exchange with a registry.
///
/// This is the seam the authentication layer wraps: [`reqwest::Client`] is
/// the plain implementation, and [`BasicTransport`] and [`BearerTransport`]
/// decorate another transport with credentials.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the registry's response.
    async fn round_trip(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        trace!(method = %request.method(), url = %request.url(), "Sending request");
        Ok(self.execute(request).await?)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        (**self).round_trip(request).await
    }
}

/// The authentication scheme a registry asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// No authentication needed
    Anonymous,
    /// HTTP Basic authentication
    Basic,
    /// Bearer tokens obtained from a token service
    Bearer,
}

/// The outcome of pinging a registry: the scheme it wants and the
/// parameters (`realm`, `service`, `scope`) it advertised for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The authentication scheme
    pub kind: ChallengeKind,
    /// The challenge parameters
    pub parameters: HashMap<String, String>,
}

/// Pings `registry`'s `/v2/` endpoint without credentials and classifies the
/// answer.
pub async fn ping<T: Transport + ?Sized>(
    registry: &str,
    protocol: &ClientProtocol,
    transport: &T,
) -> Result<Challenge> {
    let url = format!("{}://{}/v2/", protocol.scheme_for(registry), registry);
    debug!(%url, "Pinging registry");
    let request = Request::new(Method::GET, parse_url(&url)?);
    let res = transport.round_trip(request).await.map_err(|e| {
        OciDistributionError::AuthHandshakeFailed(format!("ping of {} failed: {}", url, e))
    })?;

    match res.status() {
        StatusCode::OK => Ok(Challenge {
            kind: ChallengeKind::Anonymous,
            parameters: HashMap::new(),
        }),
        StatusCode::UNAUTHORIZED => match res.headers().get(WWW_AUTHENTICATE) {
            Some(header) => parse_challenge(header),
            None => Err(OciDistributionError::AuthHandshakeFailed(format!(
                "401 from {} without a WWW-Authenticate header",
                url
            ))),
        },
        s => Err(OciDistributionError::AuthHandshakeFailed(format!(
            "unexpected status {} from {}",
            s, url
        ))),
    }
}

fn parse_challenge(header: &HeaderValue) -> Result<Challenge> {
    let auth = WwwAuthenticate::parse_header(&header.as_bytes().into()).map_err(|e| {
        OciDistributionError::AuthHandshakeFailed(format!(
            "unparseable WWW-Authenticate header {:?}: {}",
            header, e
        ))
    })?;

    let raw = String::from_utf8_lossy(header.as_bytes());
    if auth.get::<BearerChallenge>().is_some() {
        return Ok(Challenge {
            kind: ChallengeKind::Bearer,
            parameters: auth_params(&raw, BearerChallenge::challenge_name()),
        });
    }
    if auth.get::<BasicChallenge>().is_some() {
        return Ok(Challenge {
            kind: ChallengeKind::Basic,
            parameters: auth_params(&raw, BasicChallenge::challenge_name()),
        });
    }
    Err(OciDistributionError::UnsupportedChallenge(raw.into_owned()))
}

/// Performs the authentication handshake with the registry hosting
/// `reference` and returns a transport that authenticates every request
/// for `op` on it.
///
/// For Bearer registries the first token is fetched before this returns, so
/// a failed exchange fails construction.
pub async fn new<T: Transport + 'static>(
    reference: &Reference,
    auth: &RegistryAuth,
    inner: T,
    op: RegistryOperation,
    protocol: &ClientProtocol,
) -> Result<Arc<dyn Transport>> {
    let registry = reference.resolve_registry();
    let challenge = ping(registry, protocol, &inner).await?;
    debug!(%registry, kind = ?challenge.kind, "Registry challenge");

    match challenge.kind {
        ChallengeKind::Anonymous => Ok(Arc::new(inner)),
        ChallengeKind::Basic => Ok(Arc::new(BasicTransport::new(inner, auth.clone()))),
        ChallengeKind::Bearer => {
            // The realm is where Basic credentials get turned into a token.
            let realm = challenge.parameters.get("realm").cloned().ok_or_else(|| {
                OciDistributionError::AuthHandshakeFailed(format!(
                    "malformed Bearer challenge, missing realm: {:?}",
                    challenge.parameters
                ))
            })?;
            let service = challenge
                .parameters
                .get("service")
                .cloned()
                .unwrap_or_else(|| registry.to_string());
            let scope = reference.scope(op);
            let bearer = BearerTransport::new(inner, auth.clone(), realm, service, scope).await?;
            Ok(Arc::new(bearer))
        }
    }
}

/// Attaches static Basic credentials to every request.
pub struct BasicTransport<T> {
    inner: T,
    auth: RegistryAuth,
}

impl<T: Transport> BasicTransport<T> {
    /// Wraps `inner`, authenticating with `auth`.
    pub fn new(inner: T, auth: RegistryAuth) -> Self {
        BasicTransport { inner, auth }
    }
}

#[async_trait]
impl<T: Transport> Transport for BasicTransport<T> {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        self.inner
            .round_trip(request.apply_authentication(&self.auth)?)
            .await
    }
}

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl RegistryToken {
    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

/// The token currently in use, tagged with how many times it was replaced.
struct CurrentToken {
    generation: u64,
    value: String,
}

/// Attaches a Bearer token to every request and refreshes it when the
/// registry rejects it.
///
/// One instance may be shared by concurrent callers. When several requests
/// are rejected at once, only the first to take the write lock exchanges
/// for a new token; the others find the generation moved on and retry with
/// the token it obtained.
pub struct BearerTransport<T> {
    inner: T,
    basic: RegistryAuth,
    realm: String,
    service: String,
    scope: String,
    token: RwLock<CurrentToken>,
}

impl<T: Transport> BearerTransport<T> {
    /// Wraps `inner`, fetching the first token from `realm` before returning.
    pub async fn new(
        inner: T,
        basic: RegistryAuth,
        realm: String,
        service: String,
        scope: String,
    ) -> Result<Self> {
        let mut transport = BearerTransport {
            inner,
            basic,
            realm,
            service,
            scope,
            token: RwLock::new(CurrentToken {
                generation: 0,
                value: String::new(),
            }),
        };
        let value = transport.exchange().await?;
        transport.token.get_mut().value = value;
        Ok(transport)
    }

    /// Trades the Basic credentials (or nothing) for a token at the realm.
    async fn exchange(&self) -> Result<String> {
        let url = Url::parse_with_params(
            &self.realm,
            &[("scope", &self.scope), ("service", &self.service)],
        )
        .map_err(|e| {
            OciDistributionError::TokenExchangeFailed(format!(
                "invalid realm {}: {}",
                self.realm, e
            ))
        })?;
        debug!(realm = %self.realm, service = %self.service, scope = %self.scope, "Making authentication call");

        let request = Request::new(Method::GET, url).apply_authentication(&self.basic)?;
        let res = self.inner.round_trip(request).await.map_err(|e| {
            OciDistributionError::TokenExchangeFailed(format!(
                "request to {} failed: {}",
                self.realm, e
            ))
        })?;
        let status = res.status();
        let text = res.text().await.map_err(|e| {
            OciDistributionError::TokenExchangeFailed(format!(
                "failed to read token response from {}: {}",
                self.realm, e
            ))
        })?;
        if status != StatusCode::OK {
            debug!(%status, reason = %text, "Failed to authenticate");
            return Err(OciDistributionError::TokenExchangeFailed(format!(
                "{} answered {}: {}",
                self.realm, status, text
            )));
        }
        let token: RegistryToken = serde_json::from_str(&text).map_err(|e| {
            OciDistributionError::TokenExchangeFailed(format!(
                "failed to decode registry token: {}",
                e
            ))
        })?;
        debug!(scope = %self.scope, "Successfully authorized");
        Ok(token.token().to_string())
    }

    async fn current(&self) -> (u64, String) {
        let token = self.token.read().await;
        (token.generation, token.value.clone())
    }

    /// Replaces the token unless someone already replaced the one at
    /// generation `seen`, and returns the token to retry with.
    async fn refresh(&self, seen: u64) -> Result<String> {
        let mut token = self.token.write().await;
        if token.generation != seen {
            trace!(generation = token.generation, "Token already refreshed");
            return Ok(token.value.clone());
        }
        token.value = self.exchange().await?;
        token.generation += 1;
        debug!(generation = token.generation, "Refreshed bearer token");
        Ok(token.value.clone())
    }
}

fn authorize(mut request: Request, token: &str) -> Result<Request> {
    let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
        OciDistributionError::TokenExchangeFailed(format!("token is not a valid header: {}", e))
    })?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

#[async_trait]
impl<T: Transport> Transport for BearerTransport<T> {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        let retry = request.try_clone();
        let (generation, token) = self.current().await;
        let res = self.inner.round_trip(authorize(request, &token)?).await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let retry = match retry {
            Some(retry) => retry,
            None => {
                warn!(url = %res.url(), "Cannot replay request after 401");
                return Ok(res);
            }
        };
        debug!(url = %retry.url(), "Bearer token rejected, refreshing");
        drop(res);

        let token = self.refresh(generation).await?;
        let url = retry.url().to_string();
        let res = self.inner.round_trip(authorize(retry, &token)?).await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            return Err(OciDistributionError::AuthenticationFailure(url));
        }
        Ok(res)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| OciDistributionError::UrlParseError(format!("{}: {}", url, e)))
}

/// Collects every `key="value"` parameter of the `scheme` challenge in a
/// `WWW-Authenticate` header. Keys are lowercased.
fn auth_params(header: &str, scheme: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut in_scheme = false;
    for part in split_auth_params(header) {
        // `Scheme key=value` opens a new challenge.
        let param = match part.split_once(char::is_whitespace) {
            Some((name, rest)) if !name.contains('=') => {
                in_scheme = name.eq_ignore_ascii_case(scheme);
                rest.trim()
            }
            None if !part.contains('=') => {
                in_scheme = part.eq_ignore_ascii_case(scheme);
                continue;
            }
            _ => part,
        };
        if !in_scheme {
            continue;
        }
        if let Some((key, value)) = param.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

/// Splits on the commas that are not inside a quoted value.
fn split_auth_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Matches `Bearer` challenges; parameters come from [`auth_params`].
#[derive(Clone)]
struct BearerChallenge;

impl www_authenticate::Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(_) => Some(BearerChallenge),
        }
    }

    fn into_raw(self) -> RawChallenge {
        RawChallenge::Fields(ChallengeFields::new())
    }
}

#[derive(Clone)]
struct BasicChallenge;

impl www_authenticate::Challenge for BasicChallenge {
    fn challenge_name() -> &'static str {
        "Basic"
    }

    fn from_raw(_raw: RawChallenge) -> Option<Self> {
        Some(BasicChallenge)
    }

    fn into_raw(self) -> RawChallenge {
        RawChallenge::Fields(ChallengeFields::new())
    }
}
