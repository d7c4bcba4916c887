//! wgbridge CLI: apply WireGuard configurations and exchange them between nodes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use wgbridge_control::{
    init_logging, ControlPlane, IngestOutcome, IngestReport, LogConfig, Settings,
    DEFAULT_SETTINGS_PATH,
};
use wgbridge_protocol::{validate_interface_name, ConfigValidator};

/// wgbridge: transactional WireGuard configuration and signed bundle exchange
#[derive(Parser)]
#[command(name = "wgbridge")]
#[command(version)]
#[command(about = "Apply WireGuard configurations atomically and exchange them as sealed bundles", long_about = None)]
struct Cli {
    /// Settings file (defaults to /etc/wgbridge/wgbridge.toml when present)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without applying it
    Check {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Require at least one peer and full-length keys
        #[arg(long)]
        strict: bool,
    },

    /// Apply a configuration file to a live interface
    Apply {
        /// Interface name (e.g., wg0)
        interface: String,

        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Manage exchange and signing keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Export an interface's configuration as a sealed bundle
    Export {
        /// Interface name
        interface: String,

        /// Recipient exchange public key (base64)
        #[arg(short, long)]
        recipient: String,
    },

    /// Inspect and ingest inbox bundles
    Inbox {
        #[command(subcommand)]
        action: InboxAction,
    },

    /// Watch the inbox and ingest bundles as they arrive (until Ctrl+C)
    Watch,
}

#[derive(Subcommand)]
enum KeysAction {
    /// Generate any missing key material
    Ensure,
    /// Retire the current keys and re-seal inbox bundles for the new ones
    Rotate,
    /// Print the exchange public key and signing fingerprint
    Show,
}

#[derive(Subcommand)]
enum InboxAction {
    /// Show the verification status of each inbox bundle
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Ingest one bundle now
    Ingest {
        /// Bundle path
        path: PathBuf,
    },
    /// Apply the configuration staged in pending for an interface
    Promote {
        /// Interface name
        interface: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // settings drive logging, so load them first and report failure after
    // the subscriber is up
    let settings = load_settings(cli.settings.as_deref());
    let mut log_config = settings
        .as_ref()
        .map(|s| LogConfig::from_settings(&s.logging))
        .unwrap_or_default();
    if cli.verbose {
        log_config = log_config.verbose();
    }
    if matches!(cli.command, Commands::Watch) {
        log_config = log_config.watching();
    }
    init_logging(&log_config);
    let settings = settings?;

    match cli.command {
        Commands::Check { config, strict } => cmd_check(&config, strict),
        Commands::Apply { interface, config } => cmd_apply(settings, &interface, &config),
        Commands::Keys { action } => cmd_keys(settings, action),
        Commands::Export {
            interface,
            recipient,
        } => cmd_export(settings, &interface, &recipient),
        Commands::Inbox { action } => cmd_inbox(settings, action),
        Commands::Watch => cmd_watch(settings),
    }
}

/// Load settings from `--settings`, else the default path if it exists,
/// else built-in defaults
fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None if Path::new(DEFAULT_SETTINGS_PATH).exists() => {
            Settings::from_file(DEFAULT_SETTINGS_PATH)
                .with_context(|| format!("Failed to load settings from {}", DEFAULT_SETTINGS_PATH))
        }
        None => Ok(Settings::default()),
    }
}

fn open_plane(settings: Settings) -> Result<ControlPlane> {
    ControlPlane::with_wg_tool(settings).context("Failed to start control plane")
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))
}

/// Validate a configuration file
fn cmd_check(config_path: &Path, strict: bool) -> Result<()> {
    let text = read_config(config_path)?;

    let summary = wgbridge_protocol::Parser::new(strict)
        .parse(&text)
        .context("Failed to parse config file")?;
    ConfigValidator::new(strict)
        .validate(&summary)
        .context("Configuration validation failed")?;

    // wg-quick names the interface after the file
    let name_note = match config_path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if validate_interface_name(stem).is_ok() => stem.to_string(),
        _ => "(file name is not a valid interface name)".to_string(),
    };

    println!("✓ Configuration is valid");
    println!();
    println!("Summary:");
    println!("  Interface: {}", name_note);
    if let Some(address) = summary.interface.get("Address") {
        println!("  Address: {}", address);
    }
    if let Some(port) = summary.listen_port() {
        println!("  Listen Port: {}", port);
    }
    println!("  Peers: {}", summary.peers.len());

    Ok(())
}

/// Apply a configuration to a live interface
fn cmd_apply(settings: Settings, interface: &str, config_path: &Path) -> Result<()> {
    let plane = open_plane(settings)?;
    let text = read_config(config_path)?;

    let report = plane
        .apply(interface, &text)
        .with_context(|| format!("Failed to apply configuration to {}", interface))?;

    println!("✓ Applied configuration to {}", report.interface);
    println!("  Checksum: {}", report.checksum);
    println!("  Peers: {}", report.peers);
    if let Some(port) = report.listen_port {
        println!("  Listen Port: {}", port);
    }
    if report.replaced_existing {
        println!("  Replaced the previous configuration");
    }

    Ok(())
}

/// Key management
fn cmd_keys(settings: Settings, action: KeysAction) -> Result<()> {
    // startup already runs ensure_keys
    let plane = open_plane(settings)?;

    match action {
        KeysAction::Ensure => {
            println!("✓ Key material present in {}", plane.settings().paths.key_dir.display());
            println!("  Exchange key: {}", plane.exchange_key()?);
            println!("  Signing fingerprint: {}", plane.signing_fingerprint()?);
        }
        KeysAction::Rotate => {
            let report = plane.rotate_keys().context("Key rotation failed")?;
            println!("✓ Keys rotated (backup token {})", report.token);
            println!("  Exchange key: {}", report.exchange_key);
            println!("  Signing fingerprint: {}", report.signing_fingerprint);
            println!(
                "  Inbox bundles re-sealed: {} (skipped {})",
                report.reencrypted, report.skipped
            );
        }
        KeysAction::Show => {
            println!("Exchange key:        {}", plane.exchange_key()?);
            println!("Signing fingerprint: {}", plane.signing_fingerprint()?);
            println!(
                "Signing key:         {}",
                plane.keyring().signing_public()?.to_base64()
            );
        }
    }

    Ok(())
}

/// Export a live configuration
fn cmd_export(settings: Settings, interface: &str, recipient: &str) -> Result<()> {
    let plane = open_plane(settings)?;

    let report = plane
        .export_bundle(interface, recipient)
        .with_context(|| format!("Failed to export {}", interface))?;

    println!("✓ Exported {}", report.interface);
    println!("  Bundle: {}", report.bundle.display());
    println!("  Signature: {}", report.signature.display());
    println!("  Checksum: {}", report.checksum);

    Ok(())
}

/// Inbox operations
fn cmd_inbox(settings: Settings, action: InboxAction) -> Result<()> {
    let plane = open_plane(settings)?;

    match action {
        InboxAction::List { json } => {
            let bundles = plane.list_inbox_bundles().context("Failed to list inbox")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&bundles)?);
                return Ok(());
            }
            if bundles.is_empty() {
                println!("Inbox is empty");
                return Ok(());
            }
            println!("{:<40} {:>9} {:>9} {:>9}  INTERFACE", "BUNDLE", "SIGNED", "FOR US", "CHECKSUM");
            for bundle in bundles {
                println!(
                    "{:<40} {:>9} {:>9} {:>9}  {}",
                    bundle.file,
                    mark(bundle.signature),
                    mark(bundle.recipient),
                    mark(bundle.checksum),
                    bundle.interface.as_deref().unwrap_or("-")
                );
            }
        }
        InboxAction::Ingest { path } => {
            let report = plane.handle_bundle(&path);
            print_report(&report);
            if !report.is_ready() {
                anyhow::bail!("Bundle {} was rejected", path.display());
            }
        }
        InboxAction::Promote { interface } => {
            let report = plane
                .promote_pending(&interface)
                .with_context(|| format!("Failed to promote pending configuration for {}", interface))?;
            println!("✓ Applied pending configuration to {}", report.interface);
            println!("  Checksum: {}", report.checksum);
        }
    }

    Ok(())
}

/// Run the inbox watcher until Ctrl+C
fn cmd_watch(settings: Settings) -> Result<()> {
    let mut plane = open_plane(settings)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(async move {
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received shutdown signal");
            stop_signal.notify_one();
        })
        .context("Failed to set Ctrl+C handler")?;

        let mut reports = plane.start_watching().context("Failed to start inbox watcher")?;
        tracing::info!(
            "Watching {} (Ctrl+C to stop)",
            plane.settings().paths.inbox_dir.display()
        );

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                received = reports.recv() => match received {
                    Ok(report) => print_report(&report),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} ingest reports", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        plane.shutdown().await;
        tracing::info!("Watcher stopped");
        Ok(())
    })
}

fn print_report(report: &IngestReport) {
    let name = report
        .bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| report.bundle.display().to_string());

    match &report.outcome {
        IngestOutcome::Ready => println!(
            "✓ {} staged for {} ({})",
            name,
            report.interface.as_deref().unwrap_or("?"),
            report.checksum.as_deref().unwrap_or("-")
        ),
        IngestOutcome::Rejected { stage, reason } => {
            println!("✗ {} rejected at {}: {}", name, stage.as_str(), reason)
        }
    }
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "yes"
    } else {
        "no"
    }
}
