//! Itemdeck plugins CLI - validate manifests, load plugins, manage the cache

use anyhow::Context;
use clap::{Parser, Subcommand};
use itemdeck_plugins::cache::PluginCache;
use itemdeck_plugins::capability::Tier;
use itemdeck_plugins::config::Config;
use itemdeck_plugins::error::PluginError;
use itemdeck_plugins::loader::{LoadedPlugin, PluginSource};
use itemdeck_plugins::manifest::Validator;
use itemdeck_plugins::registry::BuiltinRegistry;
use serde_json::json;
use std::fmt::Display;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "itemdeck-plugins")]
#[command(author, version, about = "Itemdeck plugin manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest file
    Validate {
        /// Path to the manifest JSON
        file: PathBuf,
        /// Trust tier to validate against
        #[arg(short, long, default_value = "community")]
        tier: Tier,
    },

    /// Load a plugin from a URL or `builtin:<id>`
    Load {
        /// Plugin source
        source: String,
    },

    /// List the built-in plugins
    Builtins,

    /// Manage the plugin cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache statistics
    Stats,
    /// List cached manifests
    List {
        /// Only manifests of this tier
        #[arg(short, long)]
        tier: Option<Tier>,
        /// Include expired manifests
        #[arg(long)]
        include_expired: bool,
    },
    /// Sweep expired manifests and enforce the asset budget
    Maintain,
    /// Clear one plugin's cache, or everything
    Clear {
        /// Plugin ID
        #[arg(short, long)]
        plugin: Option<String>,
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
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "itemdeck=warn" } else { "itemdeck=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Validate { file, tier } => cmd_validate(&file, tier, cli.format, cli.quiet).await,
        Commands::Load { source } => cmd_load(&source, cli.format).await,
        Commands::Builtins => cmd_builtins(cli.format),
        Commands::Cache { action } => cmd_cache(action, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
    };

    if let Err(err) = &result {
        if let Some(plugin_err) = err.downcast_ref::<PluginError>() {
            eprintln!("[{}] {}", plugin_err.code(), plugin_err);
            if let Some(hint) = plugin_err.suggestion() {
                eprintln!("  hint: {}", hint);
            }
        }
    }
    result
}

fn join<T: Display>(items: impl IntoIterator<Item = T>) -> String {
    let joined = items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() { "-".to_string() } else { joined }
}

async fn open_cache(config: &Config) -> anyhow::Result<PluginCache> {
    let store = config.open_store().await?;
    Ok(config.plugin_cache(store))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_validate(file: &Path, tier: Tier, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read manifest: {}", file.display()))?;
    let validator = Validator::new(config.host_version()?)?;

    match validator.validate_bytes(&bytes, tier) {
        Ok(manifest) => {
            match format {
                OutputFormat::Json => {
                    let report = json!({ "valid": true, "tier": tier, "manifest": manifest });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                OutputFormat::Text if !quiet => {
                    println!(
                        "Valid: {} {} ({} plugin, {} tier)",
                        manifest.id,
                        manifest.version,
                        manifest.plugin_type(),
                        tier
                    );
                }
                OutputFormat::Text => {}
            }
            Ok(())
        }
        Err(PluginError::ValidationFailed(errors)) => {
            match format {
                OutputFormat::Json => {
                    let report = json!({ "valid": false, "tier": tier, "errors": errors });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                OutputFormat::Text => {
                    println!("Invalid: {}", file.display());
                    for error in &errors {
                        println!("  {}", error);
                    }
                }
            }
            Err(anyhow::anyhow!("{} validation error(s)", errors.len()))
        }
        Err(err) => Err(err.into()),
    }
}

fn print_plugin(plugin: &LoadedPlugin) {
    println!("Loaded {} {}", plugin.id(), plugin.manifest.version);
    println!("  Name: {}", plugin.manifest.name);
    println!("  Type: {}", plugin.plugin_type());
    println!("  Tier: {}", plugin.tier);
    println!("  Source: {}", plugin.source_key);
    if plugin.from_cache {
        let note = if plugin.stale { " (stale, source unreachable)" } else { "" };
        println!("  From cache: yes{}", note);
    }
    println!("  Granted: {}", join(&plugin.granted));
    println!("  Pending consent: {}", join(&plugin.pending_consent));
    if let Some(main) = &plugin.entry.main {
        println!("  Entry: {}", main);
    }
}

async fn cmd_load(raw: &str, format: OutputFormat) -> anyhow::Result<()> {
    let source: PluginSource = raw.parse()?;
    let config = Config::load()?;
    let store = config.open_store().await?;
    let loader = config.plugin_loader(store)?;

    let plugin = loader.load(&source).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&*plugin)?),
        OutputFormat::Text => print_plugin(&plugin),
    }
    Ok(())
}

fn cmd_builtins(format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let registry = BuiltinRegistry::with_defaults(config.host_version()?)?;
    let manifests = registry.list();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manifests)?),
        OutputFormat::Text => {
            for manifest in manifests {
                println!(
                    "{} {} [{}] - {}",
                    manifest.id,
                    manifest.version,
                    manifest.plugin_type(),
                    manifest.description
                );
                println!("  Capabilities: {}", join(&manifest.capabilities));
            }
        }
    }
    Ok(())
}

async fn cmd_cache(action: CacheAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let cache = open_cache(&config).await?;

    match action {
        CacheAction::Stats => {
            let stats = cache.get_cache_stats().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => {
                    println!("Manifests: {}", stats.manifest_count);
                    println!("Assets: {}", stats.asset_count);
                    println!(
                        "Asset size: {} / {} bytes",
                        stats.total_asset_size, config.cache.max_asset_bytes
                    );
                    println!("Updated: {}", stats.updated_at.format("%Y-%m-%d %H:%M:%S"));
                }
            }
        }
        CacheAction::List {
            tier,
            include_expired,
        } => {
            let manifests = cache.get_all_cached_manifests(tier, include_expired).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manifests)?),
                OutputFormat::Text => {
                    if manifests.is_empty() && !quiet {
                        println!("No cached manifests.");
                    }
                    let now = cache.now();
                    for entry in manifests {
                        let expired = if entry.is_expired(now) { " [expired]" } else { "" };
                        println!(
                            "{} {} ({}) expires {}{}",
                            entry.plugin_id,
                            entry.manifest.version,
                            entry.tier,
                            entry.expires_at.format("%Y-%m-%d %H:%M:%S"),
                            expired
                        );
                    }
                }
            }
        }
        CacheAction::Maintain => {
            let report = cache.perform_cache_maintenance().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text if !quiet => {
                    println!(
                        "Removed {} expired manifest(s), evicted {} asset(s).",
                        report.expired_manifests, report.evicted_assets
                    );
                }
                OutputFormat::Text => {}
            }
        }
        CacheAction::Clear { plugin } => {
            let stats = match &plugin {
                Some(plugin_id) => cache.clear_plugin_cache(plugin_id).await?,
                None => cache.clear_all_plugin_cache().await?,
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text if !quiet => match plugin {
                    Some(plugin_id) => println!("Cleared cache for {}.", plugin_id),
                    None => println!("Cleared all plugin caches."),
                },
                OutputFormat::Text => {}
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
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
            let items = config.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = items
                        .into_iter()
                        .map(|(key, value)| (key, serde_json::Value::String(value)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
