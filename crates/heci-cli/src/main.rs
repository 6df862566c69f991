//! HECI command-line client
//!
//! Connects to firmware clients over the host-embedded controller interface.

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use heci::runtime::{SessionEvent, SessionHandle};
use heci::protocol::HECI_INTERFACE;
use heci::{ClientGuid, ConnectOptions, WriteMode, HECI_VERSION};
use heci_cli::config::{default_config_path, Config};
use tracing_subscriber::EnvFilter;

/// Response buffer used for `HECI_VERSION`.
const VERSION_RESPONSE_CAPACITY: usize = 16;

/// HECI client - talk to firmware services over the host controller interface.
#[derive(Parser, Debug)]
#[command(name = "heci")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Device path (overrides the configuration)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub device: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect to a firmware client and print the maximum message size
    Connect {
        /// Client to connect to: amt, lme or a GUID
        client: ClientGuid,
    },

    /// Print the interface identifier and query its version
    Version,

    /// Write the effective configuration to the config file
    Init {
        /// Replace an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Connect, send hex-encoded messages and print the responses
    Send {
        /// Client to connect to: amt, lme or a GUID
        client: ClientGuid,

        /// Messages to send, hex-encoded
        #[arg(required = true, value_name = "HEX")]
        payloads: Vec<Payload>,

        /// Release each write only after a response arrives
        #[arg(long)]
        read_gated: bool,

        /// Number of responses to wait for (default: one per message)
        #[arg(long, value_name = "N")]
        responses: Option<usize>,

        /// Seconds to wait for each response
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
}

/// A hex-encoded message given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl FromStr for Payload {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
        hex::decode(digits.trim_start_matches("0x")).map(Payload)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Some(device) = &cli.device {
        config.device.path = device.clone();
    }

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Init { force } = cli.command {
        let path = cli.config.unwrap_or_else(default_config_path);
        config.write_to(&path, force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    config.validate()?;
    tracing::debug!(device = %config.device.path, "Configuration loaded");

    match cli.command {
        Commands::Connect { client } => {
            let options = config.connect_options();
            with_session(&config, |mut handle| async move {
                let max = handle
                    .connect(client, options)
                    .await
                    .with_context(|| format!("Failed to connect to {}", client))?;
                println!("Connected to {}", client);
                println!("Maximum message size: {} bytes", max);
                handle.disconnect().await;
                Ok(())
            })
            .await
        }
        Commands::Version => {
            with_session(&config, |handle| async move {
                let outcome = handle
                    .control(HECI_VERSION, Vec::new(), VERSION_RESPONSE_CAPACITY)
                    .await?;
                handle.disconnect().await;
                let response = outcome.context("Version request failed")?;
                println!("Interface: {}", HECI_INTERFACE);
                println!("Version: {}", hex::encode(response));
                Ok(())
            })
            .await
        }
        // Handled before validation.
        Commands::Init { .. } => Ok(()),
        Commands::Send {
            client,
            payloads,
            read_gated,
            responses,
            timeout,
        } => {
            let mut options = config.connect_options();
            if read_gated {
                options = options.with_write_mode(WriteMode::ReadGated);
            }
            let expected = responses.unwrap_or(payloads.len());
            let timeout = Duration::from_secs(timeout);

            with_session(&config, |handle| {
                send(handle, client, options, payloads, expected, timeout)
            })
            .await
        }
    }
}

/// Runs `client` against a session on the configured device.
async fn with_session<F, Fut>(config: &Config, client: F) -> anyhow::Result<()>
where
    F: FnOnce(SessionHandle) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    #[cfg(any(target_os = "linux", windows))]
    {
        use heci::runtime::Reactor;

        let (io, demux, signals) =
            heci::backend::native().context("Failed to initialize device backend")?;
        let (reactor, handle) = Reactor::new(
            io,
            demux,
            config.device.path.clone(),
            signals,
            config.session.read_queue_depth,
        );
        let ((), result) = tokio::join!(reactor.run(), client(handle));
        result
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (config, client);
        bail!("No HECI backend is available on this platform")
    }
}

async fn send(
    mut handle: SessionHandle,
    client: ClientGuid,
    options: ConnectOptions,
    payloads: Vec<Payload>,
    expected: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let max = handle
        .connect(client, options)
        .await
        .with_context(|| format!("Failed to connect to {}", client))?;
    tracing::info!(client = %client, max_message_size = max, "Connected");

    let mut received = 0;
    for (index, Payload(data)) in payloads.into_iter().enumerate() {
        let len = data.len();
        handle
            .write(data)
            .await
            .with_context(|| format!("Failed to send message {}", index + 1))?;
        tracing::debug!(bytes = len, "Message sent");

        // Read-gated writes only flush once a response is consumed.
        if options.write_mode == WriteMode::ReadGated && received < expected {
            if !receive(&mut handle, timeout).await? {
                break;
            }
            received += 1;
        }
    }

    while received < expected {
        if !receive(&mut handle, timeout).await? {
            break;
        }
        received += 1;
    }

    handle.disconnect().await;
    if received < expected {
        bail!("Received {} of {} expected responses", received, expected);
    }
    Ok(())
}

/// Prints the next inbound message; returns `false` once the stream ended.
async fn receive(handle: &mut SessionHandle, timeout: Duration) -> anyhow::Result<bool> {
    loop {
        let event = tokio::time::timeout(timeout, handle.recv())
            .await
            .context("Timed out waiting for a response")?;
        match event {
            Some(SessionEvent::Data(data)) => {
                println!("{}", hex::encode(data));
                return Ok(true);
            }
            Some(SessionEvent::End) | None => {
                tracing::warn!("Inbound stream ended");
                return Ok(false);
            }
            Some(other) => tracing::debug!(event = ?other, "Ignoring session event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_connect_command() {
        let cli = Cli::try_parse_from(["heci", "connect", "amt"]).unwrap();
        match cli.command {
            Commands::Connect { client } => assert_eq!(client, ClientGuid::AMT),
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_with_guid() {
        let cli = Cli::try_parse_from([
            "heci",
            "connect",
            "6733a4db-0476-4e7b-b3af-bcfc29bee7a7",
        ])
        .unwrap();
        match cli.command {
            Commands::Connect { client } => assert_eq!(client, ClientGuid::LME),
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_rejects_unknown_client() {
        assert!(Cli::try_parse_from(["heci", "connect", "nope"]).is_err());
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["heci", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_init_command() {
        let cli = Cli::try_parse_from(["heci", "init"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { force: false }));

        let cli = Cli::try_parse_from(["heci", "init", "--force", "--device", "/dev/mei2"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { force: true }));
        assert_eq!(cli.device.as_deref(), Some("/dev/mei2"));
    }

    #[test]
    fn test_send_command() {
        let cli = Cli::try_parse_from(["heci", "send", "lme", "0102", "ff"]).unwrap();
        match cli.command {
            Commands::Send {
                client,
                payloads,
                read_gated,
                responses,
                timeout,
            } => {
                assert_eq!(client, ClientGuid::LME);
                assert_eq!(payloads, vec![Payload(vec![1, 2]), Payload(vec![0xFF])]);
                assert!(!read_gated);
                assert_eq!(responses, None);
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_send_with_options() {
        let cli = Cli::try_parse_from([
            "heci",
            "send",
            "amt",
            "00",
            "--read-gated",
            "--responses",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Send {
                read_gated,
                responses,
                ..
            } => {
                assert!(read_gated);
                assert_eq!(responses, Some(3));
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_send_requires_payload() {
        assert!(Cli::try_parse_from(["heci", "send", "amt"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "heci",
            "version",
            "--device",
            "/dev/mei1",
            "--verbose",
            "--config",
            "/tmp/heci.toml",
        ])
        .unwrap();
        assert_eq!(cli.device.as_deref(), Some("/dev/mei1"));
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/heci.toml")));
    }

    #[test]
    fn test_payload_parsing() {
        assert_eq!("0x0a0B".parse::<Payload>().unwrap(), Payload(vec![0x0A, 0x0B]));
        assert_eq!(
            "de:ad:be:ef".parse::<Payload>().unwrap(),
            Payload(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert!("abc".parse::<Payload>().is_err());
        assert!("zz".parse::<Payload>().is_err());
    }
}
