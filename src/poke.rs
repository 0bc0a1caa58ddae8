use anyhow::Context;
use oci_remote::client::ClientConfigSource;
use oci_remote::secrets::DockerConfigKeychain;
use oci_remote::{Client, ClientConfig, ClientProtocol, Image, Reference};
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tracing::debug;

/// Command line options for poke
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "poke",
    about = "Prints the manifest, config or digest of an image in a registry"
)]
struct Opts {
    #[structopt(
        long = "insecure-registries",
        env = "POKE_INSECURE_REGISTRIES",
        use_delimiter = true,
        help = "Registries (host[:port]) to reach over plain HTTP, separated by ','"
    )]
    insecure_registries: Vec<String>,

    #[structopt(
        long = "insecure-skip-tls-verify",
        help = "Accept invalid TLS certificates from registries"
    )]
    insecure_skip_tls_verify: bool,

    #[structopt(
        long = "timeout-secs",
        env = "POKE_TIMEOUT_SECS",
        help = "Give up on a registry request after this many seconds"
    )]
    timeout_secs: Option<u64>,

    #[structopt(
        long = "docker-config",
        env = "DOCKER_CONFIG",
        help = "The directory holding the Docker CLI's config.json. Defaults to $HOME/.docker"
    )]
    docker_config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Clone, Debug)]
enum Command {
    /// Print the image's config file
    Config {
        /// The image reference, e.g. ghcr.io/org/app:v1
        reference: String,
    },
    /// Print the image's manifest
    Manifest {
        /// The image reference, e.g. ghcr.io/org/app:v1
        reference: String,
    },
    /// Print the digest of the image's manifest
    Digest {
        /// The image reference, e.g. ghcr.io/org/app:v1
        reference: String,
    },
}

impl Command {
    fn reference(&self) -> &str {
        match self {
            Command::Config { reference }
            | Command::Manifest { reference }
            | Command::Digest { reference } => reference,
        }
    }
}

impl ClientConfigSource for Opts {
    fn client_config(&self) -> ClientConfig {
        let protocol = if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        };
        ClientConfig {
            protocol,
            accept_invalid_certificates: self.insecure_skip_tls_verify,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Opts {
    fn keychain(&self) -> anyhow::Result<DockerConfigKeychain> {
        match &self.docker_config {
            Some(dir) => Ok(DockerConfigKeychain::new(dir.join("config.json"))),
            None => Ok(DockerConfigKeychain::from_env()?),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the requested document.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::from_args();
    let reference: Reference = opts
        .command
        .reference()
        .parse()
        .with_context(|| format!("invalid image reference {}", opts.command.reference()))?;
    let keychain = opts.keychain()?;
    debug!(path = %keychain.path().display(), "Using docker config");

    let image = Client::from_source(&opts)
        .image_with_keychain(&reference, &keychain)
        .await
        .with_context(|| format!("unable to open {}", reference))?;

    match &opts.command {
        Command::Config { .. } => {
            let config = image
                .config_file()
                .await
                .with_context(|| format!("unable to fetch config of {}", reference))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Manifest { .. } => {
            let manifest = image
                .manifest()
                .await
                .with_context(|| format!("unable to fetch manifest of {}", reference))?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::Digest { .. } => {
            let digest = image
                .digest()
                .await
                .with_context(|| format!("unable to fetch digest of {}", reference))?;
            println!("{}", digest);
        }
    }
    Ok(())
}
