//! OAK CLI - rolling proof-of-possession tokens backed by gpg

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oak_auth::{
    inspect, AuthError, Engine, KeyId, SecretMaterial, Session, TokenVersion,
};
use oak_client::utils::{format_timestamp_secs, read_token_arg};
use oak_client::{ClientConfig, GpgProvider, StoredToken, TokenStore};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// OAK - rolling session tokens
#[derive(Parser)]
#[command(name = "oak", version, about)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, env = "OAK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Passphrase for the gpg key
    #[arg(long, env = "OAK_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or select a key pair and print the bootstrap token
    Init(InitArgs),

    /// Store a token issued by the server
    Install {
        /// Token, or `-` to read stdin
        token: String,
    },

    /// Answer the stored token's challenge and print the rolled token
    Roll,

    /// Print the stored token's session fields as JSON
    SessionData,

    /// Describe a token without decrypting anything
    Inspect {
        /// Token to inspect (default: the stored one), or `-` for stdin
        token: Option<String>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct InitArgs {
    /// Generate a new key pair for this identity (e.g. alice@example.com)
    #[arg(long)]
    identity: Option<String>,

    /// Use an existing key pair (gpg fingerprint)
    #[arg(long)]
    key_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
        if let Some(auth) = e.downcast_ref::<AuthError>() {
            if auth.requires_bootstrap() {
                eprintln!("hint: the stored token can't be used; run `oak init` again");
            } else if auth.is_retryable() {
                eprintln!("hint: this may be transient; retry the command");
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::load(cli.config.as_deref())?;
    let store = TokenStore::new(config.token_path()?);
    debug!(token_path = %store.path().display(), "configuration loaded");

    let provider = config.gpg_provider(cli.passphrase.as_deref());
    let engine = Arc::new(Engine::with_config(
        Arc::new(provider),
        config.engine_config(),
    ));

    match cli.command {
        Commands::Init(args) => cmd_init(engine, &store, args, cli.passphrase).await,
        Commands::Install { token } => cmd_install(engine, &store, &token).await,
        Commands::Roll => cmd_roll(engine, &store).await,
        Commands::SessionData => cmd_session_data(engine, &store).await,
        Commands::Inspect { token } => cmd_inspect(&store, token.as_deref()),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_init(
    engine: Arc<Engine<GpgProvider>>,
    store: &TokenStore,
    args: InitArgs,
    passphrase: Option<String>,
) -> Result<()> {
    let material = match (args.identity, args.key_id) {
        (Some(identity), _) => {
            if passphrase.is_none() {
                warn!("OAK_PASSPHRASE not set; the new key will not be passphrase-protected");
            }
            SecretMaterial::generate(identity, passphrase.unwrap_or_default())
        }
        (None, Some(key_id)) => {
            SecretMaterial::existing(KeyId::new(key_id).context("Invalid key id")?)
        }
        (None, None) => anyhow::bail!("either --identity or --key-id is required"),
    };

    let session = Session::new(engine);
    let bootstrap = session.bootstrap(material).await?;
    let key_id = session
        .key_id()
        .await
        .context("Session has no key id after bootstrap")?;

    store.save(&StoredToken::new(key_id.as_str(), None))?;

    // Token to stdout (script-friendly), human info to stderr
    println!("{bootstrap}");
    eprintln!("Key id: {key_id}");
    eprintln!("Send the bootstrap token to the server, then `oak install` its reply.");
    Ok(())
}

async fn cmd_install(
    engine: Arc<Engine<GpgProvider>>,
    store: &TokenStore,
    token: &str,
) -> Result<()> {
    let stored = store.require()?;
    let token = read_token_arg(token).context("Failed to read token")?;

    let session = session_for(engine, &stored)?;
    session.install(&token).await?;

    let current = session
        .current_token()
        .await
        .context("Session has no token after install")?;
    store.save(&StoredToken::new(stored.key_id, Some(current)))?;
    eprintln!("Token installed");
    Ok(())
}

async fn cmd_roll(engine: Arc<Engine<GpgProvider>>, store: &TokenStore) -> Result<()> {
    let stored = store.require()?;
    let session = session_for(engine, &stored)?;

    let pending = session.begin_roll().await?;
    println!("{}", pending.token());

    // The server's reply arrives through `oak install`; keep the stored token.
    pending.abandon();
    Ok(())
}

async fn cmd_session_data(engine: Arc<Engine<GpgProvider>>, store: &TokenStore) -> Result<()> {
    let stored = store.require()?;
    let session = session_for(engine, &stored)?;

    let data = session.session_data().await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn cmd_inspect(store: &TokenStore, token: Option<&str>) -> Result<()> {
    let (token, stored) = match token {
        Some(arg) => (read_token_arg(arg).context("Failed to read token")?, None),
        None => {
            let stored = store.require()?;
            let token = stored
                .token
                .clone()
                .context("No token installed yet; run `oak install` first")?;
            (token, Some(stored))
        }
    };

    match TokenVersion::detect(&token) {
        TokenVersion::Bootstrap => {
            let bootstrap = oak_auth::BootstrapToken::from_wire(&token)?;
            let summary = serde_json::json!({
                "version": 0,
                "public_key_len": bootstrap.public_key().len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        TokenVersion::Rolling => {
            let summary = inspect(&token)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    if let Some(stored) = stored {
        eprintln!("Stored: {}", format_timestamp_secs(stored.updated_at));
    }
    Ok(())
}

/// Rebuild the client session from the store.
fn session_for(
    engine: Arc<Engine<GpgProvider>>,
    stored: &StoredToken,
) -> Result<Session<GpgProvider>> {
    match &stored.token {
        Some(token) => Ok(Session::resume(engine, token)?),
        None => {
            let key_id = KeyId::new(stored.key_id.clone()).context("Stored key id is invalid")?;
            Ok(Session::for_key(engine, key_id))
        }
    }
}
