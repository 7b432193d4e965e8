//! Command-line surface. `setup`/`token` are external-collaborator
//! contracts here (CA bootstrap and OS trust-store installation, REST
//! bearer-token management) rather than full implementations — the data
//! plane this crate builds only needs `run` to actually start anything.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "langley")]
#[command(version = VERSION)]
#[command(about = "Observability proxy for LLM API traffic", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate the CA root (if missing) and print instructions for
    /// installing it into the OS trust store.
    Setup,
    /// Start the proxy (default when no subcommand is given).
    Run,
    /// Print the REST bearer token, or rotate it with `--rotate`.
    Token {
        #[arg(long)]
        rotate: bool,
    },
}

/// Handle CLI commands that don't start the proxy. Returns `true` if a
/// command was fully handled (caller should exit without starting `run`).
pub fn handle_cli() -> anyhow::Result<bool> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Setup) => {
            handle_setup()?;
            Ok(true)
        }
        Some(Commands::Token { rotate }) => {
            handle_token(rotate)?;
            Ok(true)
        }
        Some(Commands::Run) | None => Ok(false),
    }
}

fn handle_setup() -> anyhow::Result<()> {
    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)?;
    crate::ca::Ca::load_or_create(&config.ca_cert_path(), &config.ca_key_path(), None)?;

    println!("CA root ready at {}", config.ca_cert_path().display());
    println!();
    println!("Install it into your OS trust store, then point clients' HTTPS_PROXY at");
    println!("{}.", config.proxy.listen);
    Ok(())
}

fn handle_token(rotate: bool) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if rotate || config.auth.token.is_none() {
        let token = uuid::Uuid::new_v4().to_string();
        config.auth.token = Some(token.clone());
        println!("{token}");
        println!();
        println!("Set LANGLEY_AUTH_TOKEN={token} (or save it to your config file) for the REST layer to pick it up.");
    } else {
        println!("{}", config.auth.token.expect("checked above"));
    }
    Ok(())
}
