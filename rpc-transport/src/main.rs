use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bth_rpc_transport::{commands, logging};

#[derive(Parser)]
#[command(name = "bth-rpc")]
#[command(about = "Encrypted, authenticated RPC between wallet and indexer", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "bth-rpc.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity key and write a new config
    Keygen {
        /// Name the server key will be trusted under
        #[arg(long)]
        peer_name: Option<String>,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Manage trusted peer keys
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },

    /// Run an echo server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:18444")]
        listen: String,

        /// Write our public key to this cookie file
        #[arg(long)]
        cookie: Option<PathBuf>,
    },

    /// Send one request and print the response
    Call {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:18444")]
        connect: String,

        /// Request payload
        message: String,

        /// Trust the server key found in this cookie file
        #[arg(long)]
        cookie: Option<PathBuf>,

        /// Accept a server key that is not trusted yet
        #[arg(long)]
        trust_new: bool,
    },
}

#[derive(Subcommand)]
enum PeerAction {
    /// Trust a key (hex or cookie file) under a name
    Add { name: String, key: String },
    /// Forget a peer
    Remove { name: String },
    /// List trusted peers
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;

    let config_path = cli.config;
    match cli.command {
        Commands::Keygen { peer_name, force } => {
            commands::keygen::run(&config_path, peer_name.as_deref(), force)
        }
        Commands::Peer { action } => match action {
            PeerAction::Add { name, key } => commands::peer::add(&config_path, &name, &key),
            PeerAction::Remove { name } => commands::peer::remove(&config_path, &name),
            PeerAction::List => commands::peer::list(&config_path),
        },
        Commands::Serve { listen, cookie } => commands::serve::run(&config_path, &listen, cookie),
        Commands::Call {
            connect,
            message,
            cookie,
            trust_new,
        } => commands::call::run(&config_path, &connect, &message, cookie, trust_new),
    }
}
