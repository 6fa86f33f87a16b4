use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::core::messenger::NodeMessenger;
use crate::core::shutdown::ShutdownSignal;
use crate::core::state::MgmtdContext;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub poffline_timeout: Duration,
    pub offline_timeout: Duration,
    pub states_path: PathBuf,
    pub needs_resync_path: PathBuf,
    pub buddy_groups_path: PathBuf,
    pub target_mappings_path: PathBuf,
}

/// One pass: timeout demotions, double-resync resolution, then saving whatever changed.
pub fn run_sweep_once(ctx: &MgmtdContext, cfg: &SweeperConfig, messenger: &dyn NodeMessenger) {
    let demoted = ctx.target_states.auto_offline_targets(
        cfg.poffline_timeout,
        cfg.offline_timeout,
        Some(ctx.buddy_groups.as_ref()),
    );
    if demoted {
        debug!("reachability changed during sweep");
    }

    ctx.target_states.resolve_double_resync(
        &ctx.buddy_groups,
        &ctx.nodes,
        &ctx.target_mapper,
        messenger,
    );

    save_dirty(ctx, cfg);
}

/// Persistence failures are logged; the in-memory state stays authoritative.
pub fn save_dirty(ctx: &MgmtdContext, cfg: &SweeperConfig) {
    if ctx.target_states.is_dirty()
        && let Err(e) = ctx.target_states.save_states(&cfg.states_path)
    {
        error!(path = %cfg.states_path.display(), error = %e, "failed to save target states");
    }

    if let Err(e) = ctx.target_states.save_needs_resync_list(&cfg.needs_resync_path) {
        error!(
            path = %cfg.needs_resync_path.display(),
            error = %e,
            "failed to save needs-resync list; a manual resync audit may be required"
        );
    }

    if ctx.buddy_groups.is_dirty()
        && let Err(e) = ctx.buddy_groups.save_to_file(&cfg.buddy_groups_path)
    {
        error!(path = %cfg.buddy_groups_path.display(), error = %e, "failed to save buddy groups");
    }

    if ctx.target_mapper.is_dirty()
        && let Err(e) = ctx.target_mapper.save_to_file(&cfg.target_mappings_path)
    {
        error!(path = %cfg.target_mappings_path.display(), error = %e, "failed to save target mappings");
    }
}

pub fn spawn_state_sweeper(
    ctx: MgmtdContext,
    cfg: SweeperConfig,
    messenger: Box<dyn NodeMessenger>,
    shutdown: Arc<ShutdownSignal>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("state-sweeper".into())
        .spawn(move || {
            info!(interval_ms = cfg.interval.as_millis() as u64, "state sweeper started");

            while !shutdown.wait(cfg.interval) {
                run_sweep_once(&ctx, &cfg, messenger.as_ref());
            }

            save_dirty(&ctx, &cfg);
            info!("state sweeper stopped");
        })
}
