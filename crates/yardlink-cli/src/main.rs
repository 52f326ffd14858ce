//! yardlink: agent-side CLI.
//!
//! Generates and lists agent keys, runs the check-in handshake against a
//! broker, and listens for assignments and instant actions.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use commands::checkin::CheckinArgs;
use yardlink_client::TransportKind;

/// yardlink agent client
#[derive(Parser)]
#[command(name = "yardlink", version, about = "Agent check-in and messaging over AMQP or MQTT brokers")]
struct Cli {
    /// Config file path (default: ~/.yardlink/config.toml)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Key name to sign with
    #[arg(short = 'i', long = "identity", global = true, default_value = "default")]
    identity: String,

    /// Force the transport, overriding the config file
    #[arg(short = 't', long = "transport", global = true)]
    transport: Option<TransportArg>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Amqp,
    Mqtt,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Amqp => TransportKind::Amqp,
            TransportArg::Mqtt => TransportKind::Mqtt,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Generate an RSA key pair
    Keygen {
        /// Key name
        #[arg(default_value = "default")]
        name: String,
    },

    /// List stored keys with fingerprints
    Keys,

    /// Check in to a yard and print the assigned account
    Checkin(CheckinArgs),

    /// Check in, then print assignments and instant actions until Ctrl-C
    Listen(CheckinArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("yardlink=debug,yardlink_cli=debug,yardlink_client=debug,yardlink_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("yardlink=warn,yardlink_cli=warn,yardlink_client=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let globals = commands::Globals {
        config: cli.config,
        identity: cli.identity,
        transport: cli.transport.map(TransportKind::from),
    };

    let result = match cli.command {
        Command::Keygen { name } => commands::keygen::run(&name).await,
        Command::Keys => commands::keys::run().await,
        Command::Checkin(args) => commands::checkin::run(&globals, &args).await,
        Command::Listen(args) => commands::listen::run(&globals, &args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("yardlink: {e:#}");
        std::process::exit(1);
    }
}
