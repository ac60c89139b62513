use std::process::ExitCode;

use clap::{Parser, Subcommand};

use handshake::commands::claim::ClaimArgs;
use handshake::commands::init::InitArgs;
use handshake::commands::schema::{self, SchemaTarget};
use handshake::commands::status::StatusArgs;
use handshake::commands::watch::WatchArgs;
use handshake::commands::whoami::WhoamiArgs;
use handshake::commands::GlobalArgs;
use handshake::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "handshake",
    version,
    about = "Heartbeat lease that decides which of two nodes may run guarded work"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Claim or renew ownership; prints true (act) or false (stand aside)
    Claim(ClaimArgs),
    /// Print the shared ownership record
    Status(StatusArgs),
    /// Print which node this host is
    Whoami(WhoamiArgs),
    /// Claim every cycle and run a command while this node is the owner
    Watch(WatchArgs),
    /// Write a commented handshake.toml
    Init(InitArgs),
    /// Print a JSON Schema (ownership record or config)
    Schema {
        #[arg(value_enum, default_value_t = SchemaTarget::Record)]
        target: SchemaTarget,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Claim(_) => "claim",
            Self::Status(_) => "status",
            Self::Whoami(_) => "whoami",
            Self::Watch(_) => "watch",
            Self::Init(_) => "init",
            Self::Schema { .. } => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match &cli.command {
        Commands::Claim(args) => args.execute(&cli.global),
        Commands::Status(args) => args.execute(&cli.global),
        Commands::Whoami(args) => args.execute(&cli.global),
        Commands::Watch(args) => args.execute(&cli.global),
        Commands::Init(args) => args.execute(),
        Commands::Schema { target } => schema::run_schema(*target),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
