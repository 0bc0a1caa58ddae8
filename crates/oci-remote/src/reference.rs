use crate::digest::Digest;
use crate::transport::RegistryOperation;
use lazy_static::lazy_static;
use regex::Regex;
use std::convert::{Into, TryFrom};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "index.docker.io";
const DEFAULT_TAG: &str = "latest";

lazy_static! {
    static ref TAG_REGEXP: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref COMPONENT_REGEXP: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").unwrap();
}

/// Reasons an image reference fails to parse.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The digest part is not a valid `algorithm:hex` digest
    DigestInvalidFormat,
    /// The repository contains uppercase characters
    NameContainsUppercase,
    /// The repository is empty
    NameEmpty,
    /// The repository is longer than 255 characters
    NameTooLong,
    /// A repository path component is not valid
    ReferenceInvalidFormat,
    /// The tag is not valid
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference provides a general type to represent any way of referencing images within an OCI registry.
///
/// References without a registry host are taken to be Docker Hub references,
/// and single-component Docker Hub repositories live under `library/`.
///
/// # Examples
///
/// Parsing a tagged image reference:
///
/// ```
/// use oci_remote::Reference;
///
/// let reference: Reference = "docker.io/library/hello-world:latest".parse().unwrap();
///
/// assert_eq!("docker.io/library/hello-world:latest", reference.whole().as_str());
/// assert_eq!("docker.io", reference.registry());
/// assert_eq!("index.docker.io", reference.resolve_registry());
/// assert_eq!("library/hello-world", reference.repository());
/// assert_eq!(Some("latest"), reference.tag());
/// assert_eq!(None, reference.digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// registry returns the name of the registry as written.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// resolve_registry returns the host requests are actually sent to.
    ///
    /// This only differs from [`Reference::registry`] for Docker Hub, whose
    /// API lives at `index.docker.io`.
    pub fn resolve_registry(&self) -> &str {
        match self.registry.as_str() {
            DOCKER_HUB_DOMAIN => DOCKER_HUB_REGISTRY,
            registry => registry,
        }
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// identifier returns what the manifest endpoint is addressed by: the
    /// digest if there is one, else the tag, else `latest`.
    pub fn identifier(&self) -> &str {
        self.digest()
            .or_else(|| self.tag())
            .unwrap_or(DEFAULT_TAG)
    }

    /// scope renders the token scope granting `op` on this repository.
    pub fn scope(&self, op: RegistryOperation) -> String {
        match op {
            RegistryOperation::Pull => format!("repository:{}:pull", self.repository()),
            RegistryOperation::Push => format!("repository:{}:pull,push", self.repository()),
        }
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry(), self.repository());
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

/// Whether the first path component of a name is a registry host rather than
/// the start of a Docker Hub repository.
fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err(ParseError::NameEmpty);
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let digest: Digest = digest
                    .parse()
                    .map_err(|_| ParseError::DigestInvalidFormat)?;
                (name, Some(digest.to_string()))
            }
            None => (s.as_str(), None),
        };

        // A colon after the last slash delimits the tag; earlier colons
        // belong to a registry port.
        let path_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[path_start..].find(':') {
            Some(i) => {
                let tag = &name[path_start + i + 1..];
                if !TAG_REGEXP.is_match(tag) {
                    return Err(ParseError::TagInvalidFormat);
                }
                (&name[..path_start + i], Some(tag.to_string()))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            Some(_) => (DOCKER_HUB_DOMAIN.to_string(), name.to_string()),
            None => (DOCKER_HUB_DOMAIN.to_string(), format!("library/{}", name)),
        };
        let repository = if (registry == DOCKER_HUB_DOMAIN || registry == DOCKER_HUB_REGISTRY)
            && !repository.is_empty()
            && !repository.contains('/')
        {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::NameContainsUppercase);
        }
        if !repository.split('/').all(|c| COMPONENT_REGEXP.is_match(c)) {
            return Err(ParseError::ReferenceInvalidFormat);
        }

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;
    fn try_from(string: &str) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.to_owned())
    }
}

impl Into<String> for Reference {
    fn into(self) -> String {
        self.whole()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    mod parse {
        use super::*;
        use rstest::rstest;

        fn must_parse(image: &str) -> Reference {
            Reference::try_from(image).expect("could not parse reference")
        }

        fn validate_registry_and_repository(reference: &Reference) {
            assert_eq!(reference.registry(), "myregistry.azurecr.io");
            assert_eq!(reference.repository(), "hello");
        }

        fn validate_tag(reference: &Reference) {
            assert_eq!(reference.tag(), Some("v1"));
        }

        fn validate_digest(reference: &Reference) {
            assert_eq!(
                reference.digest(),
                Some("sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9")
            );
        }

        #[test]
        fn name_too_long() {
            assert_eq!(
                Reference::try_from(format!(
                    "myregistry.azurecr.io/{}",
                    (0..256).map(|_| "a").collect::<String>()
                ))
                .err(),
                Some(ParseError::NameTooLong)
            );
        }

        #[test]
        fn owned_string() {
            let reference = Reference::from_str("myregistry.azurecr.io/hello:v1")
                .expect("could not parse reference");

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            assert_eq!(reference.digest(), None);
        }

        #[test]
        fn tag_only() {
            let reference = must_parse("myregistry.azurecr.io/hello:v1");

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            assert_eq!(reference.digest(), None);
            assert_eq!(reference.identifier(), "v1");
        }

        #[test]
        fn digest_only() {
            let reference = must_parse("myregistry.azurecr.io/hello@sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9");

            validate_registry_and_repository(&reference);
            validate_digest(&reference);
            assert_eq!(reference.tag(), None);
        }

        #[test]
        fn tag_and_digest() {
            let reference = must_parse("myregistry.azurecr.io/hello:v1@sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9");

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            validate_digest(&reference);
            // The digest wins when addressing the manifest.
            assert_eq!(
                reference.identifier(),
                "sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9"
            );
        }

        #[test]
        fn no_tag_or_digest() {
            let reference = must_parse("myregistry.azurecr.io/hello");

            validate_registry_and_repository(&reference);
            assert_eq!(reference.tag(), None);
            assert_eq!(reference.digest(), None);
            assert_eq!(reference.identifier(), "latest");
        }

        #[test]
        fn registry_with_port() {
            let reference = must_parse("localhost:5000/team/app:1.0");
            assert_eq!(reference.registry(), "localhost:5000");
            assert_eq!(reference.repository(), "team/app");
            assert_eq!(reference.tag(), Some("1.0"));
            assert_eq!(reference.whole(), "localhost:5000/team/app:1.0");
        }

        #[rstest]
        #[case("ubuntu", "library/ubuntu", None)]
        #[case("ubuntu:20.04", "library/ubuntu", Some("20.04"))]
        #[case("bitnami/redis:6", "bitnami/redis", Some("6"))]
        #[case("docker.io/alpine:3", "library/alpine", Some("3"))]
        fn docker_hub_defaults(
            #[case] image: &str,
            #[case] repository: &str,
            #[case] tag: Option<&str>,
        ) {
            let reference = must_parse(image);
            assert_eq!(reference.registry(), "docker.io");
            assert_eq!(reference.resolve_registry(), "index.docker.io");
            assert_eq!(reference.repository(), repository);
            assert_eq!(reference.tag(), tag);
        }

        #[rstest]
        #[case("", ParseError::NameEmpty)]
        #[case("myregistry.azurecr.io/", ParseError::NameEmpty)]
        #[case("myregistry.azurecr.io/Hello", ParseError::NameContainsUppercase)]
        #[case("myregistry.azurecr.io/hello:", ParseError::TagInvalidFormat)]
        #[case("myregistry.azurecr.io/hello:-v1", ParseError::TagInvalidFormat)]
        #[case("myregistry.azurecr.io/hello@sha256:beef", ParseError::DigestInvalidFormat)]
        #[case("myregistry.azurecr.io/hello//world", ParseError::ReferenceInvalidFormat)]
        fn invalid_references(#[case] image: &str, #[case] expected: ParseError) {
            assert_eq!(Reference::try_from(image).err(), Some(expected));
        }

        #[test]
        fn scopes() {
            let reference = must_parse("myregistry.azurecr.io/hello:v1");
            assert_eq!(
                reference.scope(RegistryOperation::Pull),
                "repository:hello:pull"
            );
            assert_eq!(
                reference.scope(RegistryOperation::Push),
                "repository:hello:pull,push"
            );
        }
    }
}
