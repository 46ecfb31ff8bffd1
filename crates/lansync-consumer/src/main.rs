//! LanSync consumer: entry point.
//!
//! Finds holders on the local network, pairs with one using the credential
//! bundle its operator displays, and copies its records.
//!
//! # Usage
//!
//! ```text
//! lansync-consumer browse [--seconds N] [--target ADDR]
//! lansync-consumer pair   <BUNDLE> [--device-name NAME] [--endpoint HOST:PORT]
//! lansync-consumer sync   [--bundle BUNDLE] [--out DIR] [--limit N]
//! lansync-consumer forget
//! ```
//!
//! `pair` saves a pairing record; `sync` reuses it, or pairs first when a
//! bundle is given.  The record path defaults to `pairing.toml` in the
//! platform config directory and can be changed with `--record`.
//!
//! # Environment variable overrides
//!
//! | Variable              | Description                          |
//! |-----------------------|--------------------------------------|
//! | `LANSYNC_BUNDLE`      | Credential bundle for `pair`/`sync`  |
//! | `LANSYNC_RECORD`      | Pairing record path                  |
//! | `LANSYNC_OUT`         | Output directory for `sync`          |
//! | `LANSYNC_DEVICE_NAME` | Name the holder shows for this device|

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lansync_consumer::application::sync_client::{SyncClient, SyncOptions, SyncReport};
use lansync_consumer::infrastructure::network::discovery::{
    BrowserSettings, DiscoveryBrowser, TcpProbeResolver, UdpScanner,
};
use lansync_consumer::infrastructure::storage::pairing_record::{
    default_record_path, forget_record, load_record, save_record,
};
use lansync_core::discovery::DEFAULT_DISCOVERY_PORT;
use lansync_core::CredentialBundle;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// LanSync consumer.
#[derive(Debug, Parser)]
#[command(
    name = "lansync-consumer",
    about = "Discover, pair with, and copy data from LanSync holders",
    version
)]
struct Cli {
    /// Pairing record path.
    #[arg(long, global = true, env = "LANSYNC_RECORD")]
    record: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info", env = "LANSYNC_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List holders answering on the local network.
    Browse {
        /// How long to listen before exiting.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Where to send discovery queries.
        #[arg(long, default_value_t = SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)))]
        target: SocketAddr,
    },
    /// Pair using a credential bundle and save the pairing record.
    Pair {
        /// The `lansync1.` bundle shown by the holder.
        #[arg(env = "LANSYNC_BUNDLE")]
        bundle: String,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Copy every record, pairing first when a bundle is given.
    Sync {
        #[arg(long, env = "LANSYNC_BUNDLE")]
        bundle: Option<String>,
        /// Directory receiving one `<category>.json` per category.
        #[arg(long, env = "LANSYNC_OUT")]
        out: Option<PathBuf>,
        /// Page size to request.
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Delete the saved pairing record.
    Forget,
}

#[derive(Debug, Clone, clap::Args)]
struct DeviceArgs {
    /// Name the holder lists for this device.
    #[arg(long, env = "LANSYNC_DEVICE_NAME")]
    device_name: Option<String>,
    /// Requested device id.
    #[arg(long)]
    device_id: Option<String>,
    /// Dial this `host:port` instead of the bundle's address.
    #[arg(long)]
    endpoint: Option<String>,
}

impl DeviceArgs {
    fn options(&self, page_limit: Option<usize>) -> SyncOptions {
        SyncOptions {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            page_limit,
            ..SyncOptions::default()
        }
    }

    /// Splits `--endpoint`.  IPv6 hosts are written `[::1]:4443`.
    fn endpoint(&self) -> anyhow::Result<Option<(String, u16)>> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };
        let (host, port) = endpoint
            .rsplit_once(':')
            .with_context(|| format!("endpoint {endpoint:?} is not host:port"))?;
        let port = port
            .parse()
            .with_context(|| format!("invalid port in endpoint {endpoint:?}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Some((host.to_string(), port)))
    }
}

fn record_path(cli: &Cli) -> anyhow::Result<PathBuf> {
    match &cli.record {
        Some(path) => Ok(path.clone()),
        None => default_record_path().context("cannot locate the config directory; pass --record"),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn browse(seconds: u64, target: SocketAddr) -> anyhow::Result<()> {
    let browser = DiscoveryBrowser::new(
        Arc::new(UdpScanner::new(target)),
        Arc::new(TcpProbeResolver),
        BrowserSettings::default(),
    );
    let mut updates = browser.subscribe();
    browser.start_browsing();

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let services = updates.borrow_and_update().clone();
                println!("-- {} holder(s)", services.len());
                for service in services {
                    println!("{}\t{}", service.id, service.endpoint());
                }
            }
        }
    }
    browser.stop_browsing().await;
    Ok(())
}

async fn pair_with_bundle(
    encoded: &str,
    device: &DeviceArgs,
    page_limit: Option<usize>,
    record_path: &Path,
) -> anyhow::Result<SyncClient> {
    let bundle = CredentialBundle::decode(encoded).context("invalid credential bundle")?;
    let mut client = SyncClient::new(bundle, device.options(page_limit))?;
    if let Some((host, port)) = device.endpoint()? {
        client = client.with_endpoint(host, port);
    }
    let record = client.pair().await.context("pairing failed")?;
    save_record(record_path, &record)
        .with_context(|| format!("failed to save {}", record_path.display()))?;
    info!("paired as {}; record saved to {}", record.device_id, record_path.display());
    Ok(client)
}

async fn sync(
    bundle: Option<&str>,
    out: Option<&Path>,
    page_limit: Option<usize>,
    device: &DeviceArgs,
    record_path: &Path,
) -> anyhow::Result<()> {
    let client = match bundle {
        Some(encoded) => pair_with_bundle(encoded, device, page_limit, record_path).await?,
        None => {
            let record = load_record(record_path)
                .with_context(|| format!("failed to read {}", record_path.display()))?
                .context("not paired; run `pair` or pass --bundle")?;
            let mut client = SyncClient::resume(record, device.options(page_limit))?;
            if let Some((host, port)) = device.endpoint()? {
                client = client.with_endpoint(host, port);
            }
            client
        }
    };

    let report = client.sync().await.context("sync failed")?;
    match out {
        Some(dir) => write_report(&report, dir)?,
        None => {
            for (category, records) in &report.records {
                println!("{category}\t{}", records.len());
            }
        }
    }
    Ok(())
}

fn write_report(report: &SyncReport, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    for (category, records) in &report.records {
        let path = dir.join(format!("{category}.json"));
        let json = serde_json::to_vec_pretty(records)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote {} record(s) to {}", records.len(), path.display());
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match &cli.command {
        Command::Browse { seconds, target } => browse(*seconds, *target).await,
        Command::Pair { bundle, device } => {
            let path = record_path(&cli)?;
            pair_with_bundle(bundle, device, None, &path).await.map(|_| ())
        }
        Command::Sync {
            bundle,
            out,
            limit,
            device,
        } => {
            let path = record_path(&cli)?;
            sync(bundle.as_deref(), out.as_deref(), *limit, device, &path).await
        }
        Command::Forget => {
            let path = record_path(&cli)?;
            forget_record(&path)?;
            println!("forgot {}", path.display());
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browse_defaults_to_broadcast() {
        let cli = Cli::parse_from(["lansync-consumer", "browse"]);
        match cli.command {
            Command::Browse { seconds, target } => {
                assert_eq!(seconds, 10);
                assert_eq!(target.port(), 53317);
                assert!(target.ip().to_string().starts_with("255."));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_pair_takes_bundle_and_device_name() {
        let cli = Cli::parse_from([
            "lansync-consumer",
            "pair",
            "lansync1.abc",
            "--device-name",
            "Office laptop",
        ]);
        match cli.command {
            Command::Pair { bundle, device } => {
                assert_eq!(bundle, "lansync1.abc");
                assert_eq!(device.device_name.as_deref(), Some("Office laptop"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_record_flag_is_global() {
        let cli = Cli::parse_from(["lansync-consumer", "forget", "--record", "/tmp/p.toml"]);
        assert_eq!(record_path(&cli).unwrap(), PathBuf::from("/tmp/p.toml"));
    }

    #[test]
    fn test_endpoint_parsing() {
        let mut args = DeviceArgs {
            device_name: None,
            device_id: None,
            endpoint: Some("[::1]:4443".to_string()),
        };
        assert_eq!(args.endpoint().unwrap(), Some(("::1".to_string(), 4443)));

        args.endpoint = Some("10.0.0.2:80".to_string());
        assert_eq!(args.endpoint().unwrap(), Some(("10.0.0.2".to_string(), 80)));

        args.endpoint = Some("no-port".to_string());
        assert!(args.endpoint().is_err());
    }

    #[test]
    fn test_sync_limit_flows_into_options() {
        let cli = Cli::parse_from(["lansync-consumer", "sync", "--limit", "250"]);
        let Command::Sync { limit, device, .. } = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(device.options(limit).page_limit, Some(250));
    }
}
