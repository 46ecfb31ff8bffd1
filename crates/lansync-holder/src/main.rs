//! LanSync holder: entry point.
//!
//! Shares a local dataset with consumers on the same network.  On start the
//! holder loads its TLS identity (generating one on first run), binds the
//! transport server, answers discovery queries, and prints a credential
//! bundle.  The operator hands that bundle to the consumer out of band; the
//! consumer uses it to pair and then pulls records page by page.
//!
//! # Usage
//!
//! ```text
//! lansync-holder [OPTIONS] [COMMAND]
//!
//! Commands:
//!   serve    Run the holder and print a credential bundle (default)
//!   devices  List paired devices
//!   revoke   Revoke one device, or all of them with --all
//!
//! Options:
//!   --config    <PATH>  Config file [default: platform config dir]
//!   --data-dir  <PATH>  Identity and device registry directory
//!   --dataset   <PATH>  JSON file with the records to share
//!   --name      <NAME>  Display name shown to consumers
//!   --bind      <IP>    Listener bind address
//!   --port      <PORT>  Listener port, 0 = auto
//!   --locked            Start with the device lock engaged
//! ```
//!
//! # Operator console
//!
//! While `serve` runs it reads commands from stdin, one per line:
//!
//! ```text
//! share            issue a new code and print a new bundle (the old code stops working)
//! devices          list paired devices
//! revoke <id>      revoke one device
//! revoke-all       revoke every device
//! lock | unlock    engage or release the device lock
//! help             list these commands
//! ```
//!
//! A code that expires unused is withdrawn; type `share` for a fresh one.
//!
//! # Configuration precedence
//!
//! CLI flags override `holder.toml`, which overrides the built-in defaults.
//! Every flag can also be supplied through the `LANSYNC_*` environment
//! variable listed in `--help`.
//!
//! # Architecture overview
//!
//! ```text
//! main()
//!  ├─ load HolderConfig, apply CLI overrides
//!  ├─ CredentialIssuer   (TomlDeviceStore in data_dir)
//!  ├─ Router             (InMemoryDataSource, LockState, TracingAuditSink)
//!  └─ TransportServer    (FileIdentityProvider, UdpAdvertiser)
//!       └─ share() → bundle printed to stdout
//!            └─ Console  (stdin: share, devices, revoke, lock)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lansync_core::{CredentialBundle, Fingerprint, SystemClock};
use lansync_holder::application::audit::TracingAuditSink;
use lansync_holder::application::credentials::CredentialIssuer;
use lansync_holder::application::data_source::InMemoryDataSource;
use lansync_holder::application::lock::LockState;
use lansync_holder::application::router::{Router, RouterSettings};
use lansync_holder::application::sharing::share;
use lansync_holder::infrastructure::identity::FileIdentityProvider;
use lansync_holder::infrastructure::network::advertiser::UdpAdvertiser;
use lansync_holder::infrastructure::network::local_addr::primary_lan_address;
use lansync_holder::infrastructure::network::server::{TransportServer, TransportSettings};
use lansync_holder::infrastructure::storage::config::{self, HolderConfig};
use lansync_holder::infrastructure::storage::devices::TomlDeviceStore;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// LanSync holder.
///
/// Serves a dataset over TLS to consumers that paired with a displayed
/// credential bundle.
#[derive(Debug, Parser)]
#[command(
    name = "lansync-holder",
    about = "Share a dataset with LanSync consumers on the local network",
    version
)]
struct Cli {
    /// Path to the config file.  Defaults to `holder.toml` in the platform
    /// config directory.
    #[arg(long, env = "LANSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the TLS identity and the device registry.
    #[arg(long, env = "LANSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file of the form `{"<category>": [record, ...]}`.
    #[arg(long, env = "LANSYNC_DATASET")]
    dataset: Option<PathBuf>,

    /// Display name shown in discovery and `/status`.
    #[arg(long, env = "LANSYNC_NAME")]
    name: Option<String>,

    /// IP address to bind the TLS listener to.
    #[arg(long, env = "LANSYNC_BIND")]
    bind: Option<String>,

    /// TLS listener port.  `0` lets the OS choose.
    #[arg(long, env = "LANSYNC_PORT")]
    port: Option<u16>,

    /// UDP port answering discovery queries.
    #[arg(long, env = "LANSYNC_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// Do not answer discovery queries.
    #[arg(long)]
    no_advertise: bool,

    /// Host written into the credential bundle.
    #[arg(long, env = "LANSYNC_ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Start with the device lock engaged.
    #[arg(long)]
    locked: bool,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "LANSYNC_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Run the holder and print a credential bundle.
    Serve,
    /// List paired devices.
    Devices,
    /// Revoke access for a paired device.
    Revoke {
        /// Device id as shown by `devices`.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        device_id: Option<String>,
        /// Revoke every paired device.
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    /// Applies the CLI overrides on top of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged configuration does not validate.
    fn apply_to(&self, mut config: HolderConfig) -> anyhow::Result<HolderConfig> {
        if let Some(dir) = &self.data_dir {
            config.holder.data_dir = Some(dir.clone());
        }
        if let Some(name) = &self.name {
            config.holder.display_name = name.clone();
        }
        if let Some(level) = &self.log_level {
            config.holder.log_level = level.clone();
        }
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(port) = self.discovery_port {
            config.network.discovery_port = port;
        }
        if self.no_advertise {
            config.network.advertise = false;
        }
        if let Some(host) = &self.advertise_host {
            config.network.advertise_host = Some(host.clone());
        }
        config.validate().context("invalid holder configuration")?;
        Ok(config)
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Everything `serve` needs, built from the merged configuration.
struct Holder {
    issuer: Arc<CredentialIssuer>,
    lock: Arc<LockState>,
    server: TransportServer,
}

fn build_issuer(config: &HolderConfig, data_dir: &Path) -> anyhow::Result<Arc<CredentialIssuer>> {
    let store = TomlDeviceStore::in_dir(data_dir);
    let issuer = CredentialIssuer::new(
        Arc::new(SystemClock),
        Arc::new(store),
        config.issuer_settings(),
    )
    .with_context(|| format!("failed to load device registry from {}", data_dir.display()))?;
    Ok(Arc::new(issuer))
}

fn build_holder(cli: &Cli, config: &HolderConfig, data_dir: &Path) -> anyhow::Result<Holder> {
    let issuer = build_issuer(config, data_dir)?;

    let data = match &cli.dataset {
        Some(path) => InMemoryDataSource::from_json_file(path)
            .with_context(|| format!("failed to load dataset {}", path.display()))?,
        None => {
            warn!("no dataset given; sharing an empty dataset");
            InMemoryDataSource::new()
        }
    };

    let lock = Arc::new(LockState::new(cli.locked));
    let router = Router::new(
        Arc::clone(&issuer),
        Arc::new(data),
        lock.clone(),
        Arc::new(TracingAuditSink),
        RouterSettings {
            name: config.holder.display_name.clone(),
            require_unlock: config.security.require_unlock,
            page_limits: config.page_limits(),
        },
    );

    let settings = TransportSettings {
        bind_address: config.bind_ip()?,
        port: config.network.port,
        service_name: config.holder.display_name.clone(),
        ..TransportSettings::default()
    };
    let identity = FileIdentityProvider::new(data_dir, subject_names(config));
    let mut server = TransportServer::new(settings, Arc::new(identity), Arc::new(router));

    if config.network.advertise {
        let discovery_addr = SocketAddr::new(config.bind_ip()?, config.network.discovery_port);
        server = server.with_advertiser(Arc::new(UdpAdvertiser::new(discovery_addr)));
    }

    Ok(Holder {
        issuer,
        lock,
        server,
    })
}

/// Names written into the self-signed certificate.  The consumer pins the
/// fingerprint, so these are informational.
fn subject_names(config: &HolderConfig) -> Vec<String> {
    let mut names = vec!["localhost".to_string()];
    if let Some(host) = &config.network.advertise_host {
        names.push(host.clone());
    }
    names
}

/// Host the consumer should dial, in order: configured host, the primary LAN
/// address, the bind address.
fn bundle_host(config: &HolderConfig) -> anyhow::Result<String> {
    if let Some(host) = &config.network.advertise_host {
        return Ok(host.clone());
    }
    if let Some(ip) = primary_lan_address() {
        return Ok(ip.to_string());
    }
    let bind: IpAddr = config.bind_ip()?;
    anyhow::ensure!(
        !bind.is_unspecified(),
        "cannot determine a LAN address; set --advertise-host"
    );
    Ok(bind.to_string())
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn serve(cli: &Cli, config: &HolderConfig, data_dir: &Path) -> anyhow::Result<()> {
    let holder = build_holder(cli, config, data_dir)?;

    let port = holder
        .server
        .start()
        .await
        .context("failed to start transport server")?;
    let fingerprint = holder
        .server
        .fingerprint()
        .await
        .context("server is running without an identity")?;

    let console = Console {
        issuer: Arc::clone(&holder.issuer),
        lock: Arc::clone(&holder.lock),
        host: bundle_host(config)?,
        port,
        fingerprint,
    };
    let bundle = console.share()?;
    info!(
        "holder {:?} ready on {}:{}, code expires at {}",
        config.holder.display_name,
        console.host,
        port,
        bundle.expires_at()
    );
    println!("{}", bundle.encode());

    let mut code_expires_at = Some(bundle.expires_at());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        let until_expiry = code_expires_at.map_or(Duration::MAX, time_until);
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                info!("shutdown signal received");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(command) => match console.execute(&command) {
                        Ok(outcome) => {
                            println!("{}", outcome.output);
                            if outcome.code_expires_at.is_some() {
                                code_expires_at = outcome.code_expires_at;
                            }
                        }
                        Err(e) => println!("error: {e:#}"),
                    },
                    Err(e) => println!("{e}"),
                },
                Ok(None) => {
                    info!("stdin closed; console disabled, Ctrl+C stops the holder");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("console read failed: {e}");
                    stdin_open = false;
                }
            },
            () = tokio::time::sleep(until_expiry), if code_expires_at.is_some() => {
                code_expires_at = None;
                if holder.issuer.active_code().is_none() {
                    holder.issuer.clear_code();
                    println!("pairing code is no longer valid; type `share` for a new one");
                }
            }
        }
    }

    holder.issuer.clear_code();
    holder.server.stop().await;
    info!("holder stopped");
    Ok(())
}

/// Time left until `at`, zero once it has passed.
fn time_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

// ── Operator console ──────────────────────────────────────────────────────────

/// One line typed by the operator while serving.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleCommand {
    Share,
    Devices,
    Revoke(String),
    RevokeAll,
    Lock,
    Unlock,
    Help,
}

const CONSOLE_HELP: &str = "commands: share | devices | revoke <device-id> | revoke-all | lock | unlock | help";

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("share"), None) => Self::Share,
            (Some("devices"), None) => Self::Devices,
            (Some("revoke"), Some(id)) => Self::Revoke(id.to_string()),
            (Some("revoke-all"), None) => Self::RevokeAll,
            (Some("lock"), None) => Self::Lock,
            (Some("unlock"), None) => Self::Unlock,
            (Some("help"), None) => Self::Help,
            _ => return Err(format!("unknown command {:?}; {CONSOLE_HELP}", line.trim())),
        };
        if words.next().is_some() {
            return Err(format!("too many arguments; {CONSOLE_HELP}"));
        }
        Ok(command)
    }
}

/// Result of a console command.
struct ConsoleOutcome {
    output: String,
    /// Expiry of a newly issued code.
    code_expires_at: Option<DateTime<Utc>>,
}

impl ConsoleOutcome {
    fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            code_expires_at: None,
        }
    }
}

/// Acts on the live issuer and lock of a running holder.
struct Console {
    issuer: Arc<CredentialIssuer>,
    lock: Arc<LockState>,
    host: String,
    port: u16,
    fingerprint: Fingerprint,
}

impl Console {
    fn share(&self) -> anyhow::Result<CredentialBundle> {
        share(&self.issuer, &self.host, self.port, self.fingerprint)
            .context("failed to build credential bundle")
    }

    fn execute(&self, command: &ConsoleCommand) -> anyhow::Result<ConsoleOutcome> {
        let outcome = match command {
            ConsoleCommand::Share => {
                let bundle = self.share()?;
                ConsoleOutcome {
                    output: bundle.encode(),
                    code_expires_at: Some(bundle.expires_at()),
                }
            }
            ConsoleCommand::Devices => ConsoleOutcome::text(format_devices(&self.issuer)),
            ConsoleCommand::Revoke(device_id) => {
                anyhow::ensure!(
                    self.issuer.revoke(device_id),
                    "no authorized device {device_id:?}"
                );
                ConsoleOutcome::text(format!("revoked {device_id}"))
            }
            ConsoleCommand::RevokeAll => {
                ConsoleOutcome::text(format!("revoked {} device(s)", self.issuer.revoke_all()))
            }
            ConsoleCommand::Lock => {
                self.lock.lock();
                ConsoleOutcome::text("locked")
            }
            ConsoleCommand::Unlock => {
                self.lock.unlock();
                ConsoleOutcome::text("unlocked")
            }
            ConsoleCommand::Help => ConsoleOutcome::text(CONSOLE_HELP),
        };
        Ok(outcome)
    }
}

fn format_devices(issuer: &CredentialIssuer) -> String {
    let lines: Vec<String> = issuer
        .devices()
        .iter()
        .map(|device| {
            format!(
                "{}\t{}\t{}\t{}",
                device.device_id,
                device.device_name.as_deref().unwrap_or("-"),
                if device.authorized { "authorized" } else { "revoked" },
                device.registered_at.to_rfc3339()
            )
        })
        .collect();
    if lines.is_empty() {
        "no paired devices".to_string()
    } else {
        lines.join("\n")
    }
}

fn list_devices(config: &HolderConfig, data_dir: &Path) -> anyhow::Result<()> {
    let issuer = build_issuer(config, data_dir)?;
    println!("{}", format_devices(&issuer));
    Ok(())
}

fn revoke(
    config: &HolderConfig,
    data_dir: &Path,
    device_id: Option<&str>,
    all: bool,
) -> anyhow::Result<()> {
    let issuer = build_issuer(config, data_dir)?;
    if all {
        let count = issuer.revoke_all();
        println!("revoked {count} device(s)");
        return Ok(());
    }
    let device_id = device_id.context("a device id or --all is required")?;
    anyhow::ensure!(issuer.revoke(device_id), "no authorized device {device_id:?}");
    println!("revoked {device_id}");
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file_path().context("cannot locate the config directory")?,
    };
    let file_config = config::load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let config = cli.apply_to(file_config)?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.holder.log_level)),
        )
        .init();

    let fallback_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let data_dir = config.data_dir_or(&fallback_dir);

    match &cli.command {
        None | Some(Command::Serve) => serve(&cli, &config, &data_dir).await,
        Some(Command::Devices) => list_devices(&config, &data_dir),
        Some(Command::Revoke { device_id, all }) => {
            revoke(&config, &data_dir, device_id.as_deref(), *all)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_keep_file_config() {
        // Arrange
        let cli = Cli::parse_from(["lansync-holder"]);

        // Act
        let config = cli.apply_to(HolderConfig::default()).unwrap();

        // Assert
        assert_eq!(config, HolderConfig::default());
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_cli_flags_override_file_config() {
        let cli = Cli::parse_from([
            "lansync-holder",
            "--name",
            "Kitchen iPad",
            "--port",
            "8443",
            "--bind",
            "127.0.0.1",
            "--no-advertise",
        ]);

        let config = cli.apply_to(HolderConfig::default()).unwrap();

        assert_eq!(config.holder.display_name, "Kitchen iPad");
        assert_eq!(config.network.port, 8443);
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert!(!config.network.advertise);
    }

    #[test]
    fn test_cli_invalid_bind_is_rejected() {
        let cli = Cli::parse_from(["lansync-holder", "--bind", "not.an.ip"]);
        assert!(cli.apply_to(HolderConfig::default()).is_err());
    }

    #[test]
    fn test_cli_revoke_subcommand() {
        let cli = Cli::parse_from(["lansync-holder", "revoke", "device-1"]);
        assert_eq!(
            cli.command,
            Some(Command::Revoke {
                device_id: Some("device-1".to_string()),
                all: false
            })
        );

        let cli = Cli::parse_from(["lansync-holder", "revoke", "--all"]);
        assert!(matches!(cli.command, Some(Command::Revoke { all: true, .. })));
    }

    #[test]
    fn test_cli_revoke_requires_target() {
        assert!(Cli::try_parse_from(["lansync-holder", "revoke"]).is_err());
    }

    #[test]
    fn test_bundle_host_prefers_configured_host() {
        let mut config = HolderConfig::default();
        config.network.advertise_host = Some("holder.local".to_string());
        assert_eq!(bundle_host(&config).unwrap(), "holder.local");
    }

    fn make_console(dir: &Path) -> Console {
        Console {
            issuer: build_issuer(&HolderConfig::default(), dir).unwrap(),
            lock: Arc::new(LockState::new(false)),
            host: "192.168.1.20".to_string(),
            port: 50432,
            fingerprint: Fingerprint::of_der(b"holder cert"),
        }
    }

    #[test]
    fn test_console_command_parsing() {
        assert_eq!(ConsoleCommand::parse("share"), Ok(ConsoleCommand::Share));
        assert_eq!(
            ConsoleCommand::parse("  revoke phone-1 "),
            Ok(ConsoleCommand::Revoke("phone-1".to_string()))
        );
        assert_eq!(ConsoleCommand::parse("revoke-all"), Ok(ConsoleCommand::RevokeAll));
        assert!(ConsoleCommand::parse("revoke").is_err());
        assert!(ConsoleCommand::parse("share now").is_err());
        assert!(ConsoleCommand::parse("reboot").is_err());
    }

    #[test]
    fn test_console_share_supersedes_previous_code() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let console = make_console(dir.path());
        let first = console.share().unwrap();

        // Act
        let outcome = console.execute(&ConsoleCommand::Share).unwrap();

        // Assert
        let second = CredentialBundle::decode(&outcome.output).unwrap();
        assert_eq!(outcome.code_expires_at, Some(second.expires_at()));
        assert_eq!(second.address(), "192.168.1.20:50432");
        if first.code != second.code {
            assert!(console.issuer.validate_code(&first.code).is_none());
        }
        assert!(console.issuer.validate_code(&second.code).is_some());
    }

    #[test]
    fn test_console_revoke_acts_on_live_issuer() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let console = make_console(dir.path());
        let token = lansync_holder::application::credentials::SessionToken::generate();
        console.issuer.register_device("phone-1", None, &token).unwrap();

        // Act
        let outcome = console
            .execute(&ConsoleCommand::Revoke("phone-1".to_string()))
            .unwrap();

        // Assert
        assert_eq!(outcome.output, "revoked phone-1");
        assert!(!console.issuer.validate_token(token.as_str()));
        assert!(console
            .execute(&ConsoleCommand::Revoke("phone-1".to_string()))
            .is_err());
    }

    #[test]
    fn test_console_lock_toggles_device_lock() {
        use lansync_holder::application::lock::DeviceLock;

        let dir = tempfile::tempdir().unwrap();
        let console = make_console(dir.path());

        console.execute(&ConsoleCommand::Lock).unwrap();
        assert!(console.lock.is_locked());
        console.execute(&ConsoleCommand::Unlock).unwrap();
        assert!(!console.lock.is_locked());
    }

    #[test]
    fn test_time_until_past_instant_is_zero() {
        assert_eq!(time_until(Utc::now() - chrono::Duration::seconds(5)), Duration::ZERO);
    }

    #[test]
    fn test_revoke_all_through_registry_on_disk() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let config = HolderConfig::default();
        let issuer = build_issuer(&config, dir.path()).unwrap();
        let token = lansync_holder::application::credentials::SessionToken::generate();
        issuer.register_device("device-1", None, &token).unwrap();

        // Act
        revoke(&config, dir.path(), None, true).unwrap();

        // Assert
        let reloaded = build_issuer(&config, dir.path()).unwrap();
        assert!(!reloaded.validate_token(token.as_str()));
    }
}
