use clap::{Parser, Subcommand};
use rentguard::gatekeeper::ActionClass;
use std::path::{Path, PathBuf};

pub mod check_limit;
pub mod config;
pub mod init_config;
pub mod logging;
pub mod verify_admin;
pub mod version;
pub mod watch_session;

use config::{default_config_path, ConfigError, RentguardConfig};

#[derive(Parser)]
#[command(name = "rentguard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client-side access control for the rental marketplace", long_about = None)]
pub struct Cli {
    /// Path to config file (default: <config dir>/rentguard/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file with fresh secrets
    InitConfig {
        /// Where to write the file (default: the --config path)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Ask the remote rate limiter whether an action may proceed
    CheckLimit {
        /// Action class: auth, payment, booking or general
        #[arg(long)]
        action: ActionClass,

        /// Signed-in user id (anonymous when omitted)
        #[arg(long)]
        subject: Option<String>,

        /// Override the class's request budget
        #[arg(long)]
        max: Option<u32>,

        /// Override the class's window, e.g. "15m" or "1h"
        #[arg(long)]
        window: Option<humantime::Duration>,
    },

    /// Run the admin gate against the cached session
    VerifyAdmin {
        /// Session cache file (default: from config)
        #[arg(long)]
        session: Option<PathBuf>,

        /// Privileged action to authorize, e.g. suspend_user
        #[arg(long)]
        action: Option<String>,

        /// Record the action targets
        #[arg(long, requires = "action")]
        target: Option<String>,
    },

    /// Watch the cached session until it expires or Ctrl-C
    WatchSession {
        /// Session cache file (default: from config)
        #[arg(long)]
        session: Option<PathBuf>,

        /// Extend the session whenever the expiry warning fires
        #[arg(long)]
        auto_extend: bool,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::InitConfig { path, force } => {
            init_config::execute(path.unwrap_or(config_path), force)
        }
        Commands::Version => {
            version::execute();
            Ok(())
        }
        command => {
            let config = load_config(&config_path)?;
            logging::init(&config.logging)?;

            match command {
                Commands::CheckLimit {
                    action,
                    subject,
                    max,
                    window,
                } => {
                    check_limit::execute(&config, action, subject, max, window.map(Into::into))
                        .await
                }
                Commands::VerifyAdmin {
                    session,
                    action,
                    target,
                } => verify_admin::execute(&config, session, action, target).await,
                Commands::WatchSession {
                    session,
                    auto_extend,
                } => watch_session::execute(&config, session, auto_extend).await,
                Commands::InitConfig { .. } | Commands::Version => Ok(()),
            }
        }
    }
}

/// Load the config file, falling back to defaults when it does not exist.
/// Environment overrides apply either way.
fn load_config(path: &Path) -> Result<RentguardConfig, ConfigError> {
    if path.exists() {
        return RentguardConfig::load_with_env(path);
    }

    eprintln!(
        "Config file '{}' not found, using defaults (run `rentguard init-config`)",
        path.display()
    );
    let mut config = RentguardConfig::default();
    config.apply_overrides(|name| std::env::var(name).ok());
    Ok(config)
}
