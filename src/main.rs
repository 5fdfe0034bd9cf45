//! mailsync - Sharded mailbox ingestion daemon
//!
//! Main entry point for the mailsync CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mailsync::config::{validate_config, MailsyncConfig};
use mailsync::model::{MailboxId, NewMailbox, Security};
use mailsync::notify::{NotificationSink, WebhookNotifier};
use mailsync::parser::MailParser;
use mailsync::protocol::ImapClient;
use mailsync::server::ApiServer;
use mailsync::store::{SqliteStore, Store};
use mailsync::sync::{DaemonConfig, SyncDaemon};
use mailsync::MailsyncError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

/// mailsync - Keep remote mailboxes mirrored into a local store
#[derive(Parser, Debug)]
#[command(name = "mailsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/mailsync/config.yaml)
    #[arg(short, long, env = "MAILSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config file
    #[arg(long, env = "MAILSYNC_DATABASE")]
    database: Option<PathBuf>,

    /// Override the instance id (the shard this worker owns)
    #[arg(long, env = "MAILSYNC_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the sync daemon (and the control-plane API unless disabled)
    Run {
        /// Do not start the HTTP API
        #[arg(long)]
        no_api: bool,
    },

    /// Serve the control-plane API without syncing
    Serve {
        /// Listen address (default from config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Manage mailboxes
    #[command(subcommand)]
    Mailbox(MailboxCommands),

    /// Show sync state of every mailbox
    Status,

    /// Show recent messages of a mailbox
    Messages {
        /// Mailbox id
        mailbox_id: MailboxId,

        /// Maximum number of messages
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum MailboxCommands {
    /// Add a mailbox
    Add {
        /// Email address
        address: String,

        /// IMAP server host
        #[arg(long)]
        host: String,

        /// Password (prefer the environment variable)
        #[arg(long, env = "MAILSYNC_MAILBOX_PASSWORD", hide_env_values = true)]
        password: String,

        /// Login name (default: the address)
        #[arg(short, long)]
        username: Option<String>,

        /// Server port (default: 993 for tls, 143 for starttls)
        #[arg(short, long)]
        port: Option<u16>,

        /// Connection security (tls, starttls)
        #[arg(short, long, default_value = "tls")]
        security: String,

        /// Folder to ingest (default from config)
        #[arg(short, long)]
        folder: Option<String>,

        /// Shard to assign (default: this instance)
        #[arg(long)]
        shard: Option<String>,

        /// Create the mailbox deactivated
        #[arg(long)]
        inactive: bool,
    },

    /// List mailboxes
    List,

    /// Remove a mailbox with its sync state and messages
    Remove {
        /// Mailbox id
        id: MailboxId,
    },

    /// Activate a mailbox
    Activate {
        /// Mailbox id
        id: MailboxId,
    },

    /// Deactivate a mailbox
    Deactivate {
        /// Mailbox id
        id: MailboxId,
    },

    /// Assign a mailbox to a shard
    Assign {
        /// Mailbox id
        id: MailboxId,

        /// Target shard (instance id)
        shard: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Check the configuration for errors
    Validate,

    /// Print the effective configuration
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    if let Err(e) = mailsync::logging::init(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> mailsync::Result<()> {
    // Handle init command first (creates config)
    if let Commands::Init { force } = cli.command {
        return handle_init_command(cli.config.clone(), force);
    }

    let mut config = MailsyncConfig::load_or_default(cli.config.as_deref())?;
    if let Some(instance_id) = cli.instance_id.clone() {
        config.instance_id = instance_id;
    }
    if let Some(database) = cli.database.clone() {
        config.database_path = database;
    }

    if let Commands::Config(ref cmd) = cli.command {
        return handle_config_command(cmd, &config, cli.json);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_async(cli, config))
}

async fn run_async(cli: Cli, config: MailsyncConfig) -> mailsync::Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?,
    );

    match cli.command {
        Commands::Run { no_api } => handle_run_command(config, store, no_api).await,
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.api.listen.clone());
            ApiServer::new(store, config.instance_id.clone())
                .run(&listen)
                .await
                .with_context(|| format!("Control-plane API on {} stopped", listen))?;
            Ok(())
        }
        Commands::Mailbox(cmd) => handle_mailbox_command(cmd, &config, store, cli.json).await,
        Commands::Status => handle_status_command(store, cli.json).await,
        Commands::Messages { mailbox_id, limit } => {
            handle_messages_command(store, mailbox_id, limit, cli.json).await
        }
        Commands::Init { .. } | Commands::Config(_) => Ok(()),
    }
}

fn handle_init_command(config_path: Option<PathBuf>, force: bool) -> mailsync::Result<()> {
    let config_file = config_path.unwrap_or_else(MailsyncConfig::default_path);

    if config_file.exists() && !force {
        println!("Configuration already exists at {}", config_file.display());
        println!();
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    let config = MailsyncConfig::new();
    config.save(&config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    println!("  instance_id: {}", config.instance_id);
    println!("  database:    {}", config.database_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add a mailbox:");
    println!("     MAILSYNC_MAILBOX_PASSWORD=... mailsync mailbox add you@example.com --host imap.example.com");
    println!();
    println!("  2. Start syncing:");
    println!("     mailsync run");

    Ok(())
}

fn handle_config_command(
    cmd: &ConfigCommands,
    config: &MailsyncConfig,
    json: bool,
) -> mailsync::Result<()> {
    match cmd {
        ConfigCommands::Validate => match validate_config(config) {
            Ok(()) => {
                println!("✓ Configuration is valid");
                Ok(())
            }
            Err(errors) => {
                for error in &errors {
                    println!("✗ {}", error);
                }
                Err(MailsyncError::Config(format!(
                    "{} validation error(s)",
                    errors.len()
                )))
            }
        },
        ConfigCommands::Show => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", serde_yaml::to_string(config)?);
            }
            Ok(())
        }
    }
}

async fn handle_run_command(
    config: MailsyncConfig,
    store: Arc<dyn Store>,
    no_api: bool,
) -> mailsync::Result<()> {
    mailsync::config::validate_config_result(&config)?;

    let notifier: Option<Arc<dyn NotificationSink>> = match &config.notifications.endpoint {
        Some(endpoint) => Some(Arc::new(WebhookNotifier::new(
            endpoint.clone(),
            Duration::from_secs(config.notifications.timeout_secs),
        )?)),
        None => {
            tracing::info!("No notification endpoint configured, notifications disabled");
            None
        }
    };

    let mut daemon = SyncDaemon::new(
        DaemonConfig::from_config(&config),
        store.clone(),
        Arc::new(ImapClient::new(config.protocol_timeout())),
        Arc::new(MailParser::new()),
        notifier,
    );

    let api_task = if config.api.enabled && !no_api {
        let server = ApiServer::with_daemon(
            store,
            config.instance_id.clone(),
            daemon.registry(),
            daemon.command_sender(),
        );
        let listen = config.api.listen.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(&listen).await {
                tracing::error!(error = %e, "Control-plane API stopped");
            }
        }))
    } else {
        None
    };

    let result = daemon.run().await;

    if let Some(task) = api_task {
        task.abort();
    }
    result
}

async fn handle_mailbox_command(
    cmd: MailboxCommands,
    config: &MailsyncConfig,
    store: Arc<dyn Store>,
    json: bool,
) -> mailsync::Result<()> {
    match cmd {
        MailboxCommands::Add {
            address,
            host,
            password,
            username,
            port,
            security,
            folder,
            shard,
            inactive,
        } => {
            let security: Security = security
                .parse()
                .map_err(|e: imap_session::Error| MailsyncError::Config(e.to_string()))?;
            let default_port = match security {
                Security::Tls => 993,
                Security::StartTls => 143,
            };

            let shard = shard.unwrap_or_else(|| config.instance_id.clone());
            let mut mailbox = NewMailbox::new(address, password, host, shard)
                .with_security(security)
                .with_port(port.unwrap_or(default_port))
                .with_folder(folder.unwrap_or_else(|| config.folder.clone()));
            if let Some(username) = username {
                mailbox = mailbox.with_username(username);
            }
            if inactive {
                mailbox = mailbox.inactive();
            }

            let mailbox = store.create_mailbox(mailbox).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&mailbox)?);
            } else {
                println!(
                    "✓ Added mailbox {} ({}) on shard {}",
                    mailbox.id, mailbox.address, mailbox.shard
                );
            }
        }
        MailboxCommands::List => {
            let mailboxes = store.list_mailboxes().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&mailboxes)?);
            } else if mailboxes.is_empty() {
                println!("No mailboxes configured.");
            } else {
                println!(
                    "{:<6} {:<32} {:<28} {:<8} {:<16} {}",
                    "ID", "ADDRESS", "SERVER", "ACTIVE", "SHARD", "FOLDER"
                );
                for m in mailboxes {
                    println!(
                        "{:<6} {:<32} {:<28} {:<8} {:<16} {}",
                        m.id,
                        m.address,
                        format!("{}:{} ({})", m.host, m.port, m.security),
                        if m.active { "yes" } else { "no" },
                        m.shard,
                        m.folder
                    );
                }
            }
        }
        MailboxCommands::Remove { id } => {
            store.delete_mailbox(id).await?;
            println!("✓ Removed mailbox {}", id);
        }
        MailboxCommands::Activate { id } => {
            let mailbox = store.set_active(id, true).await?;
            println!("✓ Activated mailbox {} ({})", mailbox.id, mailbox.address);
        }
        MailboxCommands::Deactivate { id } => {
            let mailbox = store.set_active(id, false).await?;
            println!("✓ Deactivated mailbox {} ({})", mailbox.id, mailbox.address);
        }
        MailboxCommands::Assign { id, shard } => {
            let mailbox = store.assign_shard(id, &shard).await?;
            println!("✓ Assigned mailbox {} to shard {}", mailbox.id, mailbox.shard);
        }
    }
    Ok(())
}

async fn handle_status_command(store: Arc<dyn Store>, json: bool) -> mailsync::Result<()> {
    let mailboxes = store.list_mailboxes().await?;
    let states: HashMap<MailboxId, _> = store
        .list_sync_states()
        .await?
        .into_iter()
        .map(|s| (s.mailbox_id, s))
        .collect();

    if json {
        let rows: Vec<serde_json::Value> = mailboxes
            .iter()
            .map(|m| {
                serde_json::json!({
                    "mailbox": m,
                    "sync_state": states.get(&m.id),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if mailboxes.is_empty() {
        println!("No mailboxes configured.");
        return Ok(());
    }

    println!(
        "{:<6} {:<32} {:<16} {:<8} {:>10} {:<26} {}",
        "ID", "ADDRESS", "SHARD", "ACTIVE", "CURSOR", "BASELINED", "LAST SYNC"
    );
    for m in mailboxes {
        let state = states.get(&m.id);
        let cursor = state.map(|s| s.cursor.to_string()).unwrap_or_else(|| "-".into());
        let baselined = state
            .and_then(|s| s.initial_sync_completed_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "pending".into());
        let last_sync = state
            .and_then(|s| s.last_synced_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into());
        println!(
            "{:<6} {:<32} {:<16} {:<8} {:>10} {:<26} {}",
            m.id,
            m.address,
            m.shard,
            if m.active { "yes" } else { "no" },
            cursor,
            baselined,
            last_sync
        );
    }
    Ok(())
}

async fn handle_messages_command(
    store: Arc<dyn Store>,
    mailbox_id: MailboxId,
    limit: usize,
    json: bool,
) -> mailsync::Result<()> {
    if store.get_mailbox(mailbox_id).await?.is_none() {
        return Err(MailsyncError::MailboxNotFound(mailbox_id));
    }

    let messages = store.list_messages(mailbox_id, limit).await?;
    let total = store.count_messages(mailbox_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    println!("Mailbox {}: {} message(s) stored", mailbox_id, total);
    for stored in messages {
        let m = &stored.message;
        println!(
            "  [{}] {}  {:<32} {}",
            m.uid,
            m.received_at.format("%Y-%m-%d %H:%M"),
            m.sender.as_deref().unwrap_or("(unknown sender)"),
            m.subject.as_deref().unwrap_or("(no subject)")
        );
    }
    Ok(())
}
