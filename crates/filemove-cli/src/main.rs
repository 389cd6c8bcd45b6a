//! FileMove CLI
//!
//! Authenticated file upload and download over TLS

mod config;
mod identity;
mod progress;
mod shell;

use clap::{Parser, Subcommand};
use console::style;
use filemove_core::identity::authenticate;
use filemove_core::{Client, Server, Username};
use filemove_transport::{Listener, TlsDialer, TlsListener, tls};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;
use identity::FileIdentityStore;
use progress::{TransferProgress, format_bytes, format_duration};

/// FileMove - authenticated file transfer with end-to-end verification
#[derive(Parser)]
#[command(name = "filemove")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Username to log in as (prompted for when omitted)
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user in the local identity store
    Signup,

    /// Log in and serve uploads and downloads until Ctrl+C
    Serve {
        /// Listen address (overrides the configuration)
        #[arg(short, long)]
        bind: Option<String>,

        /// Storage root (overrides the configuration)
        #[arg(short, long)]
        storage: Option<PathBuf>,
    },

    /// Upload a file
    Upload {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Download a stored file
    Download {
        /// Name of the stored file
        #[arg(required = true)]
        name: String,

        /// Directory to create `down-<name>/` in
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Log in and open an interactive shell
    Shell,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Signup => signup(cli.user, &config)?,
        Commands::Serve { bind, storage } => serve(cli.user, bind, storage, config).await?,
        Commands::Upload { file } => upload(cli.user, file, &config).await?,
        Commands::Download { name, output } => download(cli.user, name, output, config).await?,
        Commands::Shell => run_shell(cli.user, &config).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn prompt_username(user: Option<String>) -> anyhow::Result<String> {
    if let Some(user) = user {
        return Ok(user);
    }
    let term = console::Term::stderr();
    term.write_str("Username: ")?;
    Ok(term.read_line()?.trim().to_string())
}

fn prompt_password(prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
}

/// Prompt for credentials and check them against the identity store
fn login(user: Option<String>, config: &Config) -> anyhow::Result<Username> {
    let store = FileIdentityStore::new(&config.identity.store_file);
    let username = prompt_username(user)?;
    let password = prompt_password("Password: ")?;
    let username = authenticate(&store, &username, password.as_bytes())?;
    println!("Logged in as {}", style(&username).bold());
    Ok(username)
}

/// Create a new user
fn signup(user: Option<String>, config: &Config) -> anyhow::Result<()> {
    let store = FileIdentityStore::new(&config.identity.store_file);
    let username = Username::new(prompt_username(user)?)?;

    let password = prompt_password("Password: ")?;
    let confirm = prompt_password("Confirm password: ")?;
    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }

    store.register(&username, password.as_bytes())?;
    println!(
        "User {} created in {}",
        style(&username).bold(),
        store.path().display()
    );
    Ok(())
}

/// Run the server until Ctrl+C
async fn serve(
    user: Option<String>,
    bind: Option<String>,
    storage: Option<PathBuf>,
    mut config: Config,
) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.server.listen_addr = bind;
    }
    if let Some(storage) = storage {
        config.server.storage_root = storage;
    }
    let server_config = config.server_config()?;

    let identity = login(user, &config)?;

    let tls = tls::server_config_from_files(&config.tls.cert_file, &config.tls.key_file)?;
    let listener = TlsListener::bind(server_config.listen_addr, tls, &server_config.transport)?;
    let local_addr = listener
        .local_addr()
        .map_or_else(|| config.server.listen_addr.clone(), |addr| addr.to_string());

    println!("FileMove Server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", local_addr);
    println!("Storage: {}", server_config.storage_root.display());
    println!("Max connections: {}", server_config.admission.max_connections);
    println!("Frame format: {}", server_config.transfer.format);

    let server = Server::new(server_config, identity)?;
    let run = tokio::spawn({
        let server = server.clone();
        async move { server.run(listener).await }
    });

    println!("\nPress Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let active = server.admission().active_count();
    println!("\nShutting down, {active} session(s) still running (Ctrl+C again to abort them)...");
    server.shutdown();
    run.await??;

    tokio::select! {
        _ = server.drain() => {}
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            server.cancel_sessions();
            server.drain().await;
        }
    }

    let stats = server.stats();
    let admission = server.admission().metrics();
    println!(
        "Served {} upload(s) and {} download(s), {} failed; peak {} concurrent session(s)",
        stats.uploads, stats.downloads, stats.failures, admission.peak_active
    );
    Ok(())
}

fn connect(identity: Username, config: &Config) -> anyhow::Result<Client<TlsDialer>> {
    let client_config = config.client_config()?;
    let tls = tls::client_config_from_file(&config.tls.ca_file)?;
    let dialer = TlsDialer::new(
        client_config.server_addr.clone(),
        client_config.server_name(),
        tls,
        &client_config.transport,
    )?;
    Ok(Client::new(dialer, identity, client_config)?)
}

/// Upload one file
async fn upload(user: Option<String>, file: PathBuf, config: &Config) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }

    let identity = login(user, config)?;
    let client = connect(identity, config)?;

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(std::fs::metadata(&file)?.len()));
    println!("Server: {}", config.client.server_addr);

    let progress = TransferProgress::new();
    let started = Instant::now();
    match client.upload_with_progress(&file, &progress).await {
        Ok(report) => {
            progress.finish_with_message(format!(
                "Uploaded {} in {} (checksum {})",
                report.name,
                format_duration(started.elapsed()),
                report.digest
            ));
            Ok(())
        }
        Err(e) => {
            progress.abandon_with_message(format!("Upload failed: {e}"));
            Err(e.into())
        }
    }
}

/// Download one file
async fn download(
    user: Option<String>,
    name: String,
    output: Option<PathBuf>,
    mut config: Config,
) -> anyhow::Result<()> {
    if let Some(output) = output {
        config.client.download_root = output;
    }

    let identity = login(user, &config)?;
    let client = connect(identity, &config)?;

    let progress = TransferProgress::new();
    let started = Instant::now();
    match client.download_with_progress(&name, &progress).await {
        Ok(report) => {
            progress.finish_with_message(format!(
                "Downloaded {} ({}) to {} in {}",
                report.name,
                format_bytes(report.size),
                report.path.display(),
                format_duration(started.elapsed())
            ));
            Ok(())
        }
        Err(e) => {
            progress.abandon_with_message(format!("Download failed: {e}"));
            Err(e.into())
        }
    }
}

/// Log in once, then accept commands interactively
async fn run_shell(user: Option<String>, config: &Config) -> anyhow::Result<()> {
    let identity = login(user, config)?;
    let client = Arc::new(connect(identity, config)?);
    println!("Server: {}", config.client.server_addr);
    shell::run(client).await
}
