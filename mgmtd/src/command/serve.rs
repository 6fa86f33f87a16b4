use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use axum_server::Server;
use clap::Parser;
use tracing::{error, info};

use common::constants::{
    BUDDY_GROUPS_FILE_NAME, NEEDS_RESYNC_FILE_NAME, TARGET_MAPPINGS_FILE_NAME,
    TARGET_STATES_FILE_NAME,
};
use common::url_utils::parse_socket_addr;

use crate::core::messenger::HttpMessenger;
use crate::core::routes::build_router;
use crate::core::shutdown::ShutdownSignal;
use crate::core::state::MgmtdContext;
use crate::core::sweeper::{SweeperConfig, spawn_state_sweeper};

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Directory for the persisted state files
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8008")]
    listen: String,

    /// Target state file (inside data by default)
    #[arg(long)]
    states_file: Option<PathBuf>,

    /// Needs-resync list (inside data by default)
    #[arg(long)]
    needs_resync_file: Option<PathBuf>,

    /// Buddy group file (inside data by default)
    #[arg(long)]
    buddy_groups_file: Option<PathBuf>,

    /// Target mapping file (inside data by default)
    #[arg(long)]
    target_mappings_file: Option<PathBuf>,

    /// Silence after which a target is probably offline (seconds)
    #[arg(long, default_value_t = 60)]
    poffline_timeout_secs: u64,

    /// Silence after which a target is offline (seconds)
    #[arg(long, default_value_t = 180)]
    offline_timeout_secs: u64,

    /// State sweep interval (seconds)
    #[arg(long, default_value_t = 5)]
    sweep_interval_secs: u64,

    /// Timeout for RPCs to storage nodes (seconds)
    #[arg(long, default_value_t = 10)]
    rpc_timeout_secs: u64,
}

impl ServeArgs {
    pub fn sweeper_config(&self) -> SweeperConfig {
        let in_data = |file: &Option<PathBuf>, name: &str| {
            file.clone().unwrap_or_else(|| self.data.join(name))
        };

        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            poffline_timeout: Duration::from_secs(self.poffline_timeout_secs),
            offline_timeout: Duration::from_secs(self.offline_timeout_secs),
            states_path: in_data(&self.states_file, TARGET_STATES_FILE_NAME),
            needs_resync_path: in_data(&self.needs_resync_file, NEEDS_RESYNC_FILE_NAME),
            buddy_groups_path: in_data(&self.buddy_groups_file, BUDDY_GROUPS_FILE_NAME),
            target_mappings_path: in_data(&self.target_mappings_file, TARGET_MAPPINGS_FILE_NAME),
        }
    }
}

pub async fn serve(serve_args: ServeArgs) -> anyhow::Result<()> {
    if serve_args.offline_timeout_secs <= serve_args.poffline_timeout_secs {
        bail!("offline timeout must be longer than the probably-offline timeout");
    }

    std::fs::create_dir_all(&serve_args.data)
        .with_context(|| format!("creating {}", serve_args.data.display()))?;

    let cfg = serve_args.sweeper_config();
    let ctx = MgmtdContext::new();
    load_persisted_state(&ctx, &cfg);

    // Spawn state sweeper
    let shutdown = Arc::new(ShutdownSignal::new());
    let messenger = HttpMessenger::new(Duration::from_secs(serve_args.rpc_timeout_secs));
    let sweeper_handle =
        spawn_state_sweeper(ctx.clone(), cfg, Box::new(messenger), shutdown.clone())?;

    let app = build_router(ctx.clone());

    let socket_addr = parse_socket_addr(&serve_args.listen)?;
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!("listening on {}", serve_args.listen);

    // Graceful shutdown: ctrl+c
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    // Stop sweeper; it saves dirty state one last time
    shutdown.request();
    ctx.nodes.interrupt_waiters();
    if tokio::task::spawn_blocking(move || sweeper_handle.join())
        .await?
        .is_err()
    {
        error!("state sweeper panicked");
    }

    Ok(())
}

/// A file that cannot be read or parsed leaves its store empty; serving continues.
pub fn load_persisted_state(ctx: &MgmtdContext, cfg: &SweeperConfig) {
    match ctx.target_states.load_states(&cfg.states_path) {
        Ok(n) => info!(targets = n, "restored target states"),
        Err(e) => error!(path = %cfg.states_path.display(), error = %e, "failed to load target states"),
    }

    if let Err(e) = ctx.target_states.load_needs_resync_list(&cfg.needs_resync_path) {
        error!(path = %cfg.needs_resync_path.display(), error = %e, "failed to load needs-resync list");
    }

    match ctx.buddy_groups.load_from_file(&cfg.buddy_groups_path) {
        Ok(n) => info!(groups = n, "restored buddy groups"),
        Err(e) => error!(path = %cfg.buddy_groups_path.display(), error = %e, "failed to load buddy groups"),
    }

    match ctx.target_mapper.load_from_file(&cfg.target_mappings_path) {
        Ok(n) => info!(targets = n, "restored target mappings"),
        Err(e) => error!(path = %cfg.target_mappings_path.display(), error = %e, "failed to load target mappings"),
    }
}
