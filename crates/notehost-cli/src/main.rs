//! Notehost CLI - operator surface for the plugin runtime

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use notehost_core::config::Config;
use notehost_plugins::manifest::parse_manifest;
use notehost_plugins::{
    InstallRejection, InstallRequest, InstallSource, Permission, PluginError, PluginInfo,
    PluginRuntime,
};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "notehost")]
#[command(author, version, about = "Plugin extension host for notehost", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override storage.data_dir for this invocation
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin from a local archive or an https URL
    Install {
        /// Archive path or https URL
        source: String,
        /// Expected SHA-256 of the archive
        #[arg(long)]
        checksum: Option<String>,
        /// Manifest to use instead of the archive's plugin.toml
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Configured repository the archive was obtained through
        #[arg(long)]
        repository: Option<String>,
    },

    /// Deactivate if needed and remove a plugin
    Uninstall { id: String },

    /// Run the security validator on a local archive without installing it
    Validate { path: PathBuf },

    /// Download an archive into the artifact cache
    Fetch {
        url: String,
        #[arg(long)]
        checksum: Option<String>,
    },

    /// List installed plugins
    List,

    /// Show one plugin
    Info { id: String },

    /// Load a plugin's runtime to check it activates. Handles live only for
    /// the duration of this process.
    Activate { id: String },

    /// Deactivate a plugin
    Deactivate { id: String },

    /// Clear a plugin's ERROR state
    Reset { id: String },

    /// Grant a permission to a plugin
    Grant {
        id: String,
        /// Permission such as notes:read
        permission: String,
        /// Operator recorded on the grant
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Revoke a permission from a plugin
    Revoke {
        id: String,
        permission: String,
        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Show permissions granted to a plugin
    Grants { id: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
}

/// Remote sources are recognised by their scheme; anything else is a path
fn parse_source(raw: &str) -> InstallSource {
    if raw.contains("://") {
        InstallSource::Remote {
            url: raw.to_string(),
        }
    } else {
        InstallSource::Local(PathBuf::from(raw))
    }
}

fn parse_permission(raw: &str) -> anyhow::Result<Permission> {
    raw.parse::<Permission>().map_err(|e| anyhow!(e))
}

/// Turn a runtime error into an operator-facing one carrying its category
fn rejected(err: PluginError) -> anyhow::Error {
    let InstallRejection { category, reasons } = InstallRejection::from(&err);
    anyhow!("[{}] {}", category, reasons.join("\n  "))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_plugin(info: &PluginInfo) {
    println!("Plugin: {}", info.id);
    println!("  Name: {}", info.name);
    println!("  Version: {}", info.version);
    println!("  Author: {}", info.author);
    println!("  Runtime: {}", info.runtime.kind());
    println!("  Status: {}", info.status);
    if let Some(error) = &info.last_error {
        println!("  Last error: {}", error);
    }
    println!("  Checksum: {}", info.checksum);
    if !info.subscriptions.is_empty() {
        println!("  Subscriptions: {}", info.subscriptions.join(", "));
    }
    println!("  Registered: {}", info.registered_at.format("%Y-%m-%d %H:%M:%S"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "notehost=debug" } else { "notehost=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match cli.command {
        Commands::Config { action } => return cmd_config(action, cli.quiet),
        other => other,
    };

    let mut config = Config::load()?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    debug!(data_dir = %config.storage.data_dir.display(), "Opening plugin runtime");

    let runtime = PluginRuntime::open_default(&config).map_err(rejected)?;
    let result = run(&runtime, command, cli.format, cli.quiet).await;
    runtime.shutdown().await;
    result
}

async fn run(
    runtime: &PluginRuntime,
    command: Commands,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Install {
            source,
            checksum,
            manifest,
            repository,
        } => {
            let metadata = match manifest {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
                    Some(parse_manifest(&text).map_err(|e| anyhow!("Invalid manifest: {}", e))?)
                }
                None => None,
            };
            let request = InstallRequest {
                source: parse_source(&source),
                expected_checksum: checksum,
                metadata,
                repository,
            };
            let info = runtime.installer.install(request).await.map_err(rejected)?;
            match format {
                OutputFormat::Json => print_json(&info)?,
                OutputFormat::Text if !quiet => {
                    println!("Installed plugin '{}' ({})", info.id, info.version);
                    println!("  Status: {}", info.status);
                    println!("  Checksum: {}", info.checksum);
                    println!("\nGrant permissions with: notehost grant {} <permission>", info.id);
                }
                OutputFormat::Text => {}
            }
        }

        Commands::Uninstall { id } => {
            runtime.installer.uninstall(&id).await.map_err(rejected)?;
            if !quiet {
                println!("Plugin '{}' uninstalled.", id);
            }
        }

        Commands::Validate { path } => {
            let artifact = runtime
                .installer
                .acquire(&InstallSource::Local(path), None)
                .await
                .map_err(rejected)?;
            let verdict = runtime
                .verdicts
                .validate(&artifact)
                .await
                .map_err(|e| rejected(e.into()))?;
            // Only installed plugins keep their archive in the cache
            runtime.fetcher.cache().collect_garbage(&artifact.sha256)?;

            match format {
                OutputFormat::Json => print_json(&*verdict)?,
                OutputFormat::Text => {
                    let outcome = if verdict.passed() { "PASS" } else { "FAIL" };
                    println!("{} {}", outcome, artifact.sha256);
                    for violation in verdict.violations() {
                        println!("  {}", violation);
                    }
                }
            }
            if !verdict.passed() {
                return Err(anyhow!("Archive failed security validation"));
            }
        }

        Commands::Fetch { url, checksum } => {
            let artifact = runtime
                .fetcher
                .fetch(&url, checksum.as_deref())
                .await
                .map_err(|e| rejected(e.into()))?;
            match format {
                OutputFormat::Json => print_json(&artifact)?,
                OutputFormat::Text => {
                    println!("Cached {} ({} bytes)", artifact.sha256, artifact.size_bytes);
                    println!("  Path: {}", artifact.local_path.display());
                }
            }
        }

        Commands::List => {
            let plugins = runtime.registry.list();
            match format {
                OutputFormat::Json => print_json(&plugins)?,
                OutputFormat::Text if plugins.is_empty() => {
                    println!("No plugins installed.");
                    println!("\nInstall one with: notehost install <archive-or-url>");
                }
                OutputFormat::Text => {
                    println!("Plugins:");
                    for p in &plugins {
                        println!(
                            "  {} {} [{}] {}",
                            p.id,
                            p.version,
                            p.status,
                            p.runtime.kind()
                        );
                    }
                }
            }
        }

        Commands::Info { id } => {
            let info = runtime
                .registry
                .get(&id)
                .ok_or_else(|| anyhow!("Plugin '{}' is not installed", id))?;
            match format {
                OutputFormat::Json => print_json(&info)?,
                OutputFormat::Text => {
                    print_plugin(&info);
                    let grants = runtime.registry.granted_permissions(&id);
                    if !grants.is_empty() {
                        let names: Vec<&str> = grants.iter().map(|g| g.permission.as_str()).collect();
                        println!("  Granted: {}", names.join(", "));
                    }
                }
            }
        }

        Commands::Activate { id } => {
            let info = runtime
                .registry
                .activate(&id)
                .await
                .map_err(|e| rejected(e.into()))?;
            if !quiet {
                println!("Plugin '{}' is {} ({} runtime).", id, info.status, info.runtime.kind());
            }
        }

        Commands::Deactivate { id } => {
            let info = runtime
                .registry
                .deactivate(&id)
                .await
                .map_err(|e| rejected(e.into()))?;
            if !quiet {
                println!("Plugin '{}' is {}.", id, info.status);
            }
        }

        Commands::Reset { id } => {
            let info = runtime.registry.reset(&id).map_err(|e| rejected(e.into()))?;
            if !quiet {
                println!("Plugin '{}' is {}.", id, info.status);
            }
        }

        Commands::Grant { id, permission, by } => {
            let permission = parse_permission(&permission)?;
            runtime
                .registry
                .grant_permission(&id, permission, &by)
                .map_err(|e| rejected(e.into()))?;
            if !quiet {
                println!("Granted {} to '{}'.", permission, id);
            }
        }

        Commands::Revoke { id, permission, by } => {
            let permission = parse_permission(&permission)?;
            let revoked = runtime
                .registry
                .revoke_permission(&id, permission, &by)
                .map_err(|e| rejected(e.into()))?;
            if !quiet {
                if revoked {
                    println!("Revoked {} from '{}'.", permission, id);
                } else {
                    println!("'{}' did not hold {}.", id, permission);
                }
            }
        }

        Commands::Grants { id } => {
            if runtime.registry.status(&id).is_none() {
                return Err(anyhow!("Plugin '{}' is not installed", id));
            }
            let grants = runtime.registry.granted_permissions(&id);
            match format {
                OutputFormat::Json => print_json(&grants)?,
                OutputFormat::Text if grants.is_empty() => println!("No permissions granted."),
                OutputFormat::Text => {
                    for g in &grants {
                        println!(
                            "{} (by {}, {})",
                            g.permission,
                            g.granted_by,
                            g.granted_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        }

        Commands::Config { action } => cmd_config(action, quiet)?,
    }

    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod main_tests;
