//! Build automation tasks for FileMove
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "FileMove build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Generate a self-signed development certificate
    Certs {
        /// Output directory
        #[arg(short, long, default_value = "tls")]
        out: PathBuf,

        /// Names the certificate is valid for
        #[arg(long, default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()])]
        name: Vec<String>,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Certs { out, name, force } => generate_certs(out, name, force)?,
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

/// Write `server.crt` and `server.key` for local testing
///
/// The certificate doubles as the client's CA file.
fn generate_certs(out: PathBuf, names: Vec<String>, force: bool) -> anyhow::Result<()> {
    let cert_path = out.join("server.crt");
    let key_path = out.join("server.key");
    if !force && (cert_path.exists() || key_path.exists()) {
        anyhow::bail!(
            "{} already contains a certificate (use --force to replace it)",
            out.display()
        );
    }

    let certified = rcgen::generate_simple_self_signed(names.clone())?;
    fs::create_dir_all(&out)?;
    fs::write(&cert_path, certified.cert.pem())?;
    fs::write(&key_path, certified.key_pair.serialize_pem())?;

    println!("Certificate for {}:", names.join(", "));
    println!("  {}", cert_path.display());
    println!("  {}", key_path.display());
    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
