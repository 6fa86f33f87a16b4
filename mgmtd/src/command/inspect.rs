use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::core::state_file::{decode_states, parse_needs_resync_list};

#[derive(Parser, Debug, Clone)]
pub struct InspectArgs {
    /// Target state file to decode
    #[arg(long)]
    states_file: PathBuf,

    /// Needs-resync list to print alongside
    #[arg(long)]
    needs_resync_file: Option<PathBuf>,
}

/// Prints persisted target states without starting a daemon.
pub async fn inspect_states(args: InspectArgs) -> anyhow::Result<()> {
    let buf = std::fs::read(&args.states_file)
        .with_context(|| format!("reading {}", args.states_file.display()))?;
    let records = decode_states(&buf)?;

    println!("{:>6}  {:<17} {:<13} {}", "target", "reachability", "consistency", "changed");
    for r in &records {
        println!(
            "{:>6}  {:<17} {:<13} {}.{:09}",
            r.target_id,
            r.state.reachability.to_string(),
            r.state.consistency.to_string(),
            r.changed_secs,
            r.changed_nanos
        );
    }
    println!("{} targets", records.len());

    if let Some(path) = args.needs_resync_file {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let targets = parse_needs_resync_list(&text);
        println!("needs resync: {:?}", targets);
    }

    Ok(())
}
