//! Modelgate server and admin CLI.

use actix_web::{web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use modelgate::auth::AuthManager;
use modelgate::config::GatewayConfig;
use modelgate::gateway::CallerTags;
use modelgate::key_pool::KeyPoolManager;
use modelgate::models::Provider;
use modelgate::server::config_routes;
use modelgate::util::{cors_from_origins, init_tracing, AppState};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Multi-provider LLM gateway with pooled credentials", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (.yaml/.yml or .json)
    #[arg(short, long, env = "MODELGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long, env = "BIND_ADDR", global = true)]
    bind: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default)
    Serve,
    /// Manage upstream provider credentials directly in the store. A sled store is
    /// locked by a running server; use the /v1/admin routes then.
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
    /// Manage caller API keys directly in the store (same locking caveat as credentials)
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Add a credential; the secret is read from --secret-env
    Add {
        #[arg(long)]
        provider: Provider,
        /// Environment variable holding the secret
        #[arg(long)]
        secret_env: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Activate { id: String },
    Deactivate { id: String },
}

#[derive(Subcommand)]
enum KeyAction {
    Generate {
        #[arg(long)]
        org: String,
        #[arg(long, default_value = "")]
        project: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        ttl_seconds: Option<u64>,
    },
    List,
    Revoke { id: String },
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load_from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Credentials { action } => credentials(&config, action),
        Commands::Keys { action } => keys(&config, action),
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let state = web::Data::new(AppState::from_config(&config)?);
    let origins = config.cors_origins.clone();
    let bind_addr = config.bind_addr.clone();

    info!(
        providers = ?state.router.registry().providers(),
        auth = state.auth.mode(),
        "Starting modelgate on {}",
        bind_addr
    );

    HttpServer::new(move || {
        App::new()
            .wrap(cors_from_origins(&origins))
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {bind_addr}"))?
    .run()
    .await?;

    info!("HTTP server stopped");
    Ok(())
}

fn credentials(config: &GatewayConfig, action: CredentialAction) -> Result<()> {
    let pool = KeyPoolManager::from_backend(config.storage.credentials_backend()?)?;
    match action {
        CredentialAction::Add {
            provider,
            secret_env,
            description,
        } => {
            let secret = std::env::var(&secret_env)
                .with_context(|| format!("environment variable {secret_env} is not set"))?;
            let cred = pool.add_credential(provider, &secret, description)?;
            println!("{}", cred.id);
        }
        CredentialAction::List => {
            println!("{}", serde_json::to_string_pretty(&pool.list_credentials()?)?);
        }
        CredentialAction::Activate { id } => set_active(&pool, &id, true)?,
        CredentialAction::Deactivate { id } => set_active(&pool, &id, false)?,
    }
    Ok(())
}

fn set_active(pool: &KeyPoolManager, id: &str, active: bool) -> Result<()> {
    if !pool.set_active(id, active)? {
        return Err(anyhow!("credential {id} not found"));
    }
    Ok(())
}

fn keys(config: &GatewayConfig, action: KeyAction) -> Result<()> {
    let manager = AuthManager::from_backend(config.storage.auth_keys_backend()?)?;
    match action {
        KeyAction::Generate {
            org,
            project,
            user,
            label,
            ttl_seconds,
        } => {
            let identity = CallerTags {
                organization_id: org,
                project_id: project,
                user_id: user,
            };
            let generated =
                manager.generate_key(identity, label, ttl_seconds.map(Duration::from_secs))?;
            println!("{}", serde_json::to_string_pretty(&generated)?);
        }
        KeyAction::List => {
            println!("{}", serde_json::to_string_pretty(&manager.list_keys()?)?);
        }
        KeyAction::Revoke { id } => {
            if !manager.revoke(&id)? {
                return Err(anyhow!("key {id} not found or already revoked"));
            }
        }
    }
    Ok(())
}
