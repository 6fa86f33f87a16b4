use clap::{Parser, Subcommand};

use common::telemetry::init_telemetry;

use mgmtd::command::inspect::{InspectArgs, inspect_states};
use mgmtd::command::serve::{ServeArgs, serve};
use mgmtd::command::sync::{SyncArgs, sync};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the management daemon
    Serve(ServeArgs),
    /// Mirror a management daemon's state into local stores
    Sync(SyncArgs),
    /// Print a persisted target state file
    InspectStates(InspectArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("mgmtd");

    let args = Args::parse();

    match args.cmd {
        Cmd::Serve(serve_args) => {
            serve(serve_args).await?;
        }
        Cmd::Sync(sync_args) => {
            sync(sync_args).await?;
        }
        Cmd::InspectStates(inspect_args) => {
            inspect_states(inspect_args).await?;
        }
    }

    Ok(())
}
