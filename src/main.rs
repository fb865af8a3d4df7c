//! Keyward CLI - session, capability and API key management against an
//! identity authority
//!
//! Run `keyward --help` for usage information.

use clap::{Parser, Subcommand};
use keyward::authority::{HttpAuthority, IdentityAuthority};
use keyward::config::{parse_base_url, Config, LogFormat};
use keyward::keys::{ApiKey, DeleteOutcome};
use keyward::users::NewUser;
use keyward::{ApiKeyManager, Capability, Gate, KeywardError, SessionMonitor, User, UserAdmin};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "keyward",
    about = "Session, capability and API key lifecycle client for an identity authority",
    version
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Identity authority base URL (overrides the config file)
    #[arg(long, global = true, env = "KEYWARD_AUTHORITY")]
    authority: Option<String>,

    /// Bearer token from `keyward login`
    #[arg(long, global = true, env = "KEYWARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange a username and password for an access token
    Login {
        username: String,

        /// Password (will prompt if not provided)
        #[arg(long)]
        password: Option<String>,
    },

    /// Invalidate the current token
    Logout,

    /// Show the current session
    Whoami {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Check whether the session holds a capability
    Can {
        /// Capability name, e.g. manage_users
        capability: String,

        /// Owner of the target resource, for ownership-scoped capabilities
        #[arg(long)]
        owner: Option<String>,
    },

    /// Manage API keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Manage users (admin)
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Initialize configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Create a new API key
    Create {
        /// Key name
        name: String,

        /// Days until expiry (omit for no expiry)
        #[arg(short, long)]
        expires_in_days: Option<i64>,
    },

    /// List API keys
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show one API key
    Show { id: String },

    /// Suspend an API key
    Suspend { id: String },

    /// Resume a suspended API key
    Resume { id: String },

    /// Extend an API key's expiry
    Extend {
        id: String,

        /// Days to add
        days: i64,
    },

    /// Delete an API key
    Delete { id: String },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List users
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Create a user
    Create {
        username: String,

        #[arg(short, long)]
        email: String,

        /// Password (will prompt if not provided)
        #[arg(long)]
        password: Option<String>,

        /// Role to grant (repeatable)
        #[arg(short, long = "role")]
        roles: Vec<String>,

        /// Create the user deactivated
        #[arg(long)]
        inactive: bool,
    },

    /// Activate a user
    Activate { id: String },

    /// Deactivate a user
    Deactivate { id: String },

    /// Replace a user's roles
    Roles {
        id: String,

        /// Roles to set (empty clears all roles)
        roles: Vec<String>,
    },

    /// Reset a user's password
    Password {
        id: String,

        /// New password (will prompt if not provided)
        #[arg(long)]
        password: Option<String>,
    },

    /// Delete a user
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path).await?
    } else {
        let default_path = Config::default_path();
        if default_path.exists() {
            Config::load(&default_path).await?
        } else {
            Config::default()
        }
    };
    if let Some(url) = &cli.authority {
        config.authority.base_url = parse_base_url(url)?;
    }

    init_logging(&config, cli.verbose);
    debug!(authority = %config.authority.base_url, "Configuration loaded");

    match cli.command {
        Commands::Init { force } => init_config(force).await,
        Commands::Login { username, password } => login(&config, &username, password).await,
        command => {
            let token = cli.token.ok_or(
                "No access token. Run `keyward login` and export KEYWARD_TOKEN, or pass --token.",
            )?;
            let monitor = connect(&config, SecretString::from(token)).await?;
            run(command, monitor).await
        }
    }
}

/// Set up tracing from config, with `-v` overriding the configured level
fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (pretty, json) = match config.logging.format {
        LogFormat::Pretty => (Some(fmt::layer().with_writer(io::stderr)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

fn build_authority(config: &Config) -> Result<Arc<HttpAuthority>, Box<dyn std::error::Error>> {
    Ok(Arc::new(HttpAuthority::from_config(&config.authority)?))
}

/// Establish a session from a stored token
async fn connect(
    config: &Config,
    token: SecretString,
) -> Result<Arc<SessionMonitor>, Box<dyn std::error::Error>> {
    let monitor = Arc::new(SessionMonitor::new(build_authority(config)?));
    monitor.establish(token).await?;
    Ok(monitor)
}

async fn run(command: Commands, monitor: Arc<SessionMonitor>) -> Result<(), Box<dyn std::error::Error>> {
    let gate = Arc::new(Gate::new(monitor.clone()));

    match command {
        Commands::Logout => {
            monitor.logout().await;
            println!("Logged out");
        }
        Commands::Whoami { format } => whoami(&gate, &format)?,
        Commands::Can { capability, owner } => can(&gate, &capability, owner.as_deref())?,
        Commands::Key { command } => run_key_command(command, ApiKeyManager::new(gate)).await?,
        Commands::User { command } => run_user_command(command, UserAdmin::new(gate)).await?,
        Commands::Init { .. } | Commands::Login { .. } => {}
    }

    Ok(())
}

/// Read a secret from the terminal without echo
fn prompt_secret(prompt: &str) -> Result<SecretString, Box<dyn std::error::Error>> {
    eprint!("{}", prompt);
    io::stderr().flush()?;

    let value = rpassword::read_password()?;
    Ok(SecretString::from(value))
}

async fn login(
    config: &Config,
    username: &str,
    password: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let password = match password {
        Some(p) => SecretString::from(p),
        None => prompt_secret("Password: ")?,
    };

    let authority = build_authority(config)?;
    let token = authority
        .exchange_credentials(username, &password)
        .await
        .map_err(KeywardError::from)?;

    let monitor = SessionMonitor::new(authority);
    let token_text = token.expose_secret().to_string();
    monitor.establish(token).await?;

    info!(username, "Logged in");
    eprintln!("Logged in as {}. Export the token to use it:", username);
    println!("export KEYWARD_TOKEN={}", token_text);
    Ok(())
}

fn whoami(gate: &Gate, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let monitor = gate.monitor();
    let mut roles: Vec<String> = monitor.current_roles().into_iter().collect();
    roles.sort();
    let mut capabilities: Vec<String> = gate
        .capabilities()
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    capabilities.sort();

    match format {
        "json" => {
            let json = serde_json::json!({
                "state": monitor.state(),
                "subject": monitor.subject(),
                "username": monitor.username(),
                "roles": roles,
                "capabilities": capabilities,
                "expires_at": monitor.expires_at(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            println!("State:        {}", monitor.state());
            println!("Username:     {}", monitor.username().unwrap_or_default());
            println!("Subject:      {}", monitor.subject().unwrap_or_default());
            println!("Roles:        {}", roles.join(", "));
            println!("Capabilities: {}", capabilities.join(", "));
            if let Some(expires_at) = monitor.expires_at() {
                println!(
                    "Expires:      {}",
                    expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
    }
    Ok(())
}

fn can(gate: &Gate, name: &str, owner: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(capability) = Capability::parse(name) else {
        return Err(format!("Unknown capability '{}'", name).into());
    };

    let allowed = match owner {
        Some(owner) => gate.can_perform_on(capability, owner),
        None => gate.can_perform(capability),
    };

    if allowed {
        println!("allowed");
        Ok(())
    } else {
        Err(format!("denied: session does not hold '{}'", capability).into())
    }
}

// ==================== API Keys ====================

async fn run_key_command(
    command: KeyCommands,
    manager: ApiKeyManager,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        KeyCommands::Create {
            name,
            expires_in_days,
        } => {
            let created = manager.create(&name, expires_in_days).await?;
            let key = created.key;

            println!("API key created successfully!\n");
            println!("Key: {}", created.secret.reveal());
            println!("\n*** SAVE THIS KEY - IT WILL NOT BE SHOWN AGAIN ***\n");
            print_key(&key);
        }
        KeyCommands::List { format } => {
            let keys = manager.list().await?;
            print_keys(&keys, &format)?;
        }
        KeyCommands::Show { id } => print_key(&manager.get(&id).await?),
        KeyCommands::Suspend { id } => {
            let key = manager.suspend(&id).await?;
            println!("API key '{}' (ID: {}) is {}", key.name, key.id, key.status);
        }
        KeyCommands::Resume { id } => {
            let key = manager.resume(&id).await?;
            println!("API key '{}' (ID: {}) is {}", key.name, key.id, key.status);
        }
        KeyCommands::Extend { id, days } => {
            let key = manager.extend(&id, days).await?;
            println!("API key '{}' (ID: {}) extended", key.name, key.id);
            print_key(&key);
        }
        KeyCommands::Delete { id } => match manager.delete(&id).await? {
            DeleteOutcome::Deleted => println!("API key {} deleted", id),
            DeleteOutcome::AlreadyDeleted => println!("API key {} was already deleted", id),
        },
    }
    Ok(())
}

fn print_key(key: &ApiKey) {
    println!("Name:      {}", key.name);
    println!("ID:        {}", key.id);
    println!("Owner:     {}", key.owner_id);
    println!("Status:    {}", key.status);
    println!(
        "Created:   {}",
        key.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    match key.expires_at {
        Some(expires_at) => println!("Expires:   {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Expires:   Never"),
    }
    match key.last_used_at {
        Some(used) => println!("Last used: {}", used.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last used: Never"),
    }
}

fn print_keys(keys: &[ApiKey], format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(keys)?);
        return Ok(());
    }

    if keys.is_empty() {
        println!("No API keys found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<12} {}",
        "ID", "NAME", "STATUS", "EXPIRES", "LAST USED"
    );
    println!("{}", "-".repeat(100));
    for key in keys {
        let expires = key
            .expires_at
            .map(|e| e.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "Never".to_string());
        let last_used = key
            .last_used_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "Never".to_string());

        println!(
            "{:<38} {:<20} {:<10} {:<12} {}",
            key.id,
            key.name,
            key.status.to_string(),
            expires,
            last_used
        );
    }
    Ok(())
}

// ==================== Users ====================

async fn run_user_command(
    command: UserCommands,
    admin: UserAdmin,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        UserCommands::List { format } => {
            let users = admin.list().await?;
            print_users(&users, &format)?;
        }
        UserCommands::Create {
            username,
            email,
            password,
            roles,
            inactive,
        } => {
            let password = match password {
                Some(p) => SecretString::from(p),
                None => prompt_secret("Password for new user: ")?,
            };
            let new_user = NewUser {
                username,
                email,
                password,
                roles: roles.into_iter().collect(),
                is_active: !inactive,
            };
            let user = admin.create(new_user).await?;
            println!("User '{}' created (ID: {})", user.username, user.id);
        }
        UserCommands::Activate { id } => {
            admin.activate(&id).await?;
            println!("User {} activated", id);
        }
        UserCommands::Deactivate { id } => {
            admin.deactivate(&id).await?;
            println!("User {} deactivated", id);
        }
        UserCommands::Roles { id, roles } => {
            let roles: HashSet<String> = roles.into_iter().collect();
            admin.set_roles(&id, roles).await?;
            println!("Roles updated for user {}", id);
        }
        UserCommands::Password { id, password } => {
            let password = match password {
                Some(p) => SecretString::from(p),
                None => prompt_secret("New password: ")?,
            };
            admin.reset_password(&id, password).await?;
            println!("Password reset for user {}", id);
        }
        UserCommands::Delete { id } => {
            admin.delete(&id).await?;
            println!("User {} deleted", id);
        }
    }
    Ok(())
}

fn print_users(users: &[User], format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        let json: Vec<serde_json::Value> = users
            .iter()
            .map(|u| {
                let mut roles: Vec<&String> = u.roles.iter().collect();
                roles.sort();
                serde_json::json!({
                    "id": u.id,
                    "username": u.username,
                    "email": u.email,
                    "roles": roles,
                    "is_active": u.is_active,
                    "created_at": u.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if users.is_empty() {
        println!("No users found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<8} {}",
        "ID", "USERNAME", "ACTIVE", "ROLES"
    );
    println!("{}", "-".repeat(90));
    for user in users {
        let mut roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        roles.sort_unstable();
        println!(
            "{:<38} {:<20} {:<8} {}",
            user.id,
            user.username,
            if user.is_active { "yes" } else { "no" },
            roles.join(", ")
        );
    }
    Ok(())
}

/// Write a starter configuration file
async fn init_config(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = Config::default_path();

    if config_path.exists() && !force {
        return Err(format!(
            "Configuration already exists at {}. Use --force to overwrite.",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&config_path, Config::template()).await?;

    println!("Configuration written to {}", config_path.display());
    Ok(())
}
