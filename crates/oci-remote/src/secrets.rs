//! Types for working with registry access secrets

use crate::errors::{OciDistributionError, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// A method for authenticating to a registry
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Access the registry anonymously
    Anonymous,
    /// Access the registry using HTTP Basic authentication
    Basic(String, String),
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic(username, _) => write!(f, "Basic({}, ***)", username),
        }
    }
}

impl RegistryAuth {
    /// The value of an `Authorization` header carrying these credentials, if
    /// there are any.
    pub(crate) fn basic_header(&self) -> Result<Option<HeaderValue>> {
        match self {
            RegistryAuth::Anonymous => Ok(None),
            RegistryAuth::Basic(username, password) => {
                let encoded = base64::encode(format!("{}:{}", username, password));
                HeaderValue::from_str(&format!("Basic {}", encoded))
                    .map(Some)
                    .map_err(|e| OciDistributionError::KeychainError(e.to_string()))
            }
        }
    }
}

pub(crate) trait Authenticable: Sized {
    fn apply_authentication(self, auth: &RegistryAuth) -> Result<Self>;
}

impl Authenticable for reqwest::Request {
    fn apply_authentication(mut self, auth: &RegistryAuth) -> Result<Self> {
        if let Some(value) = auth.basic_header()? {
            self.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(self)
    }
}

/// Maps a registry host to the credentials used for it.
pub trait Keychain {
    /// Returns the credentials for `registry`, or [`RegistryAuth::Anonymous`]
    /// when none are configured.
    fn resolve(&self, registry: &str) -> Result<RegistryAuth>;
}

/// A keychain that always answers [`RegistryAuth::Anonymous`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> Result<RegistryAuth> {
        Ok(RegistryAuth::Anonymous)
    }
}

#[derive(Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Deserialize, Default)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// A keychain backed by the Docker CLI's `config.json`.
///
/// The file is looked up in `$DOCKER_CONFIG` and then in `~/.docker`. A
/// missing file means every registry is accessed anonymously.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    path: PathBuf,
}

impl DockerConfigKeychain {
    /// A keychain reading the given `config.json`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DockerConfigKeychain { path: path.into() }
    }

    /// A keychain reading the `config.json` the Docker CLI would use.
    pub fn from_env() -> Result<Self> {
        let dir = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    OciDistributionError::KeychainError(
                        "unable to get home directory".to_string(),
                    )
                })?
                .join(".docker"),
        };
        Ok(Self::new(dir.join("config.json")))
    }

    /// The file this keychain reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<DockerConfig> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                OciDistributionError::KeychainError(format!(
                    "unable to parse {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No docker config found");
                Ok(DockerConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        let config = self.load()?;
        let mut keys = vec![
            registry.to_string(),
            format!("https://{}", registry),
            format!("http://{}", registry),
        ];
        if registry == "docker.io" || registry == "index.docker.io" {
            keys.push(DOCKER_HUB_AUTH_KEY.to_string());
        }

        let entry = match keys.iter().find_map(|k| config.auths.get(k)) {
            Some(entry) => entry,
            None => {
                debug!(%registry, "No credentials configured");
                return Ok(RegistryAuth::Anonymous);
            }
        };

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(RegistryAuth::Basic(username.clone(), password.clone()));
        }
        match &entry.auth {
            Some(auth) => {
                let decoded = base64::decode(auth)
                    .map_err(|e| OciDistributionError::KeychainError(e.to_string()))?;
                let decoded = String::from_utf8(decoded)
                    .map_err(|e| OciDistributionError::KeychainError(e.to_string()))?;
                let (username, password) = decoded.split_once(':').ok_or_else(|| {
                    OciDistributionError::KeychainError(format!(
                        "auth entry for {} is not of the form user:password",
                        registry
                    ))
                })?;
                debug!(%registry, %username, "Resolved basic credentials");
                Ok(RegistryAuth::Basic(username.to_string(), password.to_string()))
            }
            None => Ok(RegistryAuth::Anonymous),
        }
    }
}
