//! Pinhole CLI - manage temporary inbound IPv6 allow rules

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{ConfigManager, PinholeConfig};
use pinhole_control::{PinholeCriteria, PinholeInfo, PinholeManager, PinholeSpec};
use pinhole_proto::{IPPROTO_TCP, IPPROTO_UDP};
use pinhole_store::FileRuleStore;

/// Pinhole - open, inspect and expire IPv6 firewall pinholes
#[derive(Parser, Debug)]
#[command(name = "pinhole")]
#[command(about = "Manage temporary inbound IPv6 allow rules in a firewall anchor")]
#[command(version)]
struct Cli {
    /// Config file (JSON)
    #[arg(long, env = "PINHOLE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Rule file backing the store (overrides the config file)
    #[arg(long, env = "PINHOLE_RULES", global = true)]
    rules: Option<PathBuf>,

    /// Anchor holding the pinholes (overrides the config file)
    #[arg(long, env = "PINHOLE_ANCHOR", global = true)]
    anchor: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CriteriaArgs {
    /// Inbound interface
    #[arg(long)]
    interface: Option<String>,

    /// Remote host allowed in; omit or use '*' for any
    #[arg(long)]
    remote_host: Option<String>,

    /// Remote port allowed in; 0 for any
    #[arg(long, default_value_t = 0)]
    remote_port: u16,

    /// Internal IPv6 address to expose
    #[arg(long)]
    local_host: String,

    /// Internal port to expose
    #[arg(long)]
    local_port: u16,

    /// Protocol name (tcp, udp) or number
    #[arg(long, default_value = "tcp", value_parser = parse_protocol)]
    protocol: u8,
}

impl CriteriaArgs {
    fn into_criteria(self) -> PinholeCriteria {
        PinholeCriteria {
            interface: self.interface,
            remote_host: self.remote_host,
            remote_port: self.remote_port,
            local_host: self.local_host,
            local_port: self.local_port,
            protocol: self.protocol,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a pinhole
    Add {
        #[command(flatten)]
        criteria: CriteriaArgs,

        /// Description stored with the pinhole
        #[arg(long, default_value = "")]
        description: String,

        /// Lifetime in seconds from now
        #[arg(long, default_value_t = 3600)]
        lease: u32,

        /// Absolute expiry (seconds since the epoch), overrides --lease
        #[arg(long)]
        expiry: Option<u32>,
    },
    /// Find a pinhole by its exact match criteria
    Find {
        #[command(flatten)]
        criteria: CriteriaArgs,
    },
    /// Delete a pinhole
    Delete {
        /// Pinhole id
        id: u16,
    },
    /// Show a pinhole's details and counters
    Info {
        /// Pinhole id
        id: u16,
    },
    /// Change a pinhole's lease (not supported by the rule store)
    Update {
        /// Pinhole id
        id: u16,

        /// New lifetime in seconds from now
        #[arg(long, default_value_t = 3600)]
        lease: u32,
    },
    /// Remove expired pinholes once
    Clean,
    /// List all pinholes
    List,
    /// Keep removing expired pinholes until interrupted
    Watch {
        /// Longest pause between sweeps, in seconds
        #[arg(long, default_value_t = 60)]
        max_interval: u64,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration, including --rules and --anchor
    Save,
}

fn parse_protocol(value: &str) -> Result<u8, String> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(IPPROTO_TCP),
        "udp" => Ok(IPPROTO_UDP),
        "udplite" => Ok(136),
        "icmp6" | "ipv6-icmp" => Ok(58),
        other => other
            .parse::<u8>()
            .map_err(|_| format!("unknown protocol '{}'", value)),
    }
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();
}

/// Current time as the 32-bit seconds stored in pinhole labels
fn unix_now() -> u32 {
    let now = chrono::Utc::now().timestamp().max(0);
    u32::try_from(now).unwrap_or(u32::MAX)
}

fn print_pinhole(pinhole: &PinholeInfo) {
    let remote = match pinhole.remote_addr {
        Some(addr) => addr.to_string(),
        None => "any".to_string(),
    };
    let remote_port = match pinhole.remote_port {
        0 => "any".to_string(),
        port => port.to_string(),
    };
    println!("Pinhole {}", pinhole.id);
    println!(
        "  Interface:   {}",
        pinhole.interface.as_deref().unwrap_or("any")
    );
    println!("  Protocol:    {}", pinhole.protocol);
    println!("  Remote:      [{}]:{}", remote, remote_port);
    println!(
        "  Local:       [{}]:{}",
        pinhole.local_addr, pinhole.local_port
    );
    println!("  Description: {}", pinhole.description);
    println!("  Expires:     {}", pinhole.expiry);
    println!(
        "  Traffic:     {} packets, {} bytes",
        pinhole.packets, pinhole.bytes
    );
}

fn handle_config_command(
    command: &ConfigCommands,
    config: &PinholeConfig,
    path: Option<&Path>,
) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let json =
                serde_json::to_string_pretty(config).context("Failed to serialize config")?;
            println!("{}", json);
        }
        ConfigCommands::Save => {
            let path = match path {
                Some(path) => path.to_path_buf(),
                None => ConfigManager::default_config_path()?,
            };
            ConfigManager::save(config, &path)?;
            println!("Configuration saved to {}", path.display());
        }
    }
    Ok(())
}

/// Sweep expired pinholes, sleeping until the earliest remaining expiry
async fn watch(manager: &PinholeManager, max_interval: Duration) -> Result<()> {
    info!(
        "Watching anchor {} for expired pinholes (Ctrl+C to stop)",
        manager.anchor()
    );

    loop {
        let now = unix_now();
        let pause = match manager.clean_expired(now) {
            Ok(report) => match report.next_wakeup {
                Some(ts) => Duration::from_secs(u64::from(ts.saturating_sub(now)).max(1))
                    .min(max_interval),
                None => max_interval,
            },
            Err(e) => {
                error!("Sweep failed: {}", e);
                max_interval
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                return Ok(());
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    // `config save` may create the file it is pointed at
    let mut config = match (&cli.command, cli.config.as_deref()) {
        (Commands::Config { .. }, Some(path)) if !path.exists() => PinholeConfig::default(),
        (_, path) => ConfigManager::load(path)?,
    };
    if let Some(rules) = cli.rules {
        config.rules_path = Some(rules);
    }
    if let Some(anchor) = cli.anchor {
        config.manager.anchor = anchor;
    }

    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command, &config, cli.config.as_deref());
    }

    let rules_path = ConfigManager::rules_path(&config)?;
    let store = Arc::new(FileRuleStore::new(rules_path));
    let manager = PinholeManager::open(store, config.manager.clone())
        .context("Failed to open pinhole anchor")?;

    match cli.command {
        Commands::Add {
            criteria,
            description,
            lease,
            expiry,
        } => {
            let expiry = expiry.unwrap_or_else(|| unix_now().saturating_add(lease));
            let spec = PinholeSpec::new(criteria.into_criteria(), description, expiry);
            let id = manager.add(&spec).context("Failed to add pinhole")?;
            println!("{}", id);
        }
        Commands::Find { criteria } => {
            let found = manager
                .find(&criteria.into_criteria())
                .context("Failed to find pinhole")?;
            println!(
                "{} (expires {}) {}",
                found.id, found.expiry, found.description
            );
        }
        Commands::Delete { id } => {
            manager.delete(id).context("Failed to delete pinhole")?;
            println!("Deleted pinhole {}", id);
        }
        Commands::Info { id } => {
            let pinhole = manager.get_info(id).context("Failed to get pinhole")?;
            print_pinhole(&pinhole);
        }
        Commands::Update { id, lease } => {
            let expiry = unix_now().saturating_add(lease);
            manager
                .update(id, expiry)
                .context("Failed to update pinhole (delete and re-add it instead)")?;
        }
        Commands::Clean => {
            let report = manager
                .clean_expired(unix_now())
                .context("Failed to clean expired pinholes")?;
            println!("Removed {} expired pinhole(s)", report.removed);
            if let Some(next) = report.next_wakeup {
                println!("Next expiry at {}", next);
            }
        }
        Commands::List => {
            let pinholes = manager.list().context("Failed to list pinholes")?;
            if pinholes.is_empty() {
                println!("No pinholes in anchor {}", manager.anchor());
            }
            for pinhole in &pinholes {
                print_pinhole(pinhole);
            }
        }
        Commands::Watch { max_interval } => {
            watch(&manager, Duration::from_secs(max_interval.max(1))).await?;
        }
        // Handled before the store is opened
        Commands::Config { .. } => {}
    }

    Ok(())
}
