use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use common::schemas::NodeType;

use crate::core::shutdown::ShutdownSignal;
use crate::core::state::MgmtdContext;
use crate::core::syncer::{HttpAuthority, InternodeSyncer, spawn_internode_syncer};

#[derive(Parser, Debug, Clone)]
pub struct SyncArgs {
    /// Base URL of the management daemon
    #[arg(long)]
    authority_url: String,

    /// Sync interval (seconds)
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// Download timeout (seconds)
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Category of this daemon (mgmt, meta, storage, client)
    #[arg(long, default_value = "storage")]
    local_node_type: String,

    /// Numeric ID of this daemon; it is never dropped from the local registry
    #[arg(long)]
    local_node_id: Option<u16>,
}

pub async fn sync(sync_args: SyncArgs) -> anyhow::Result<()> {
    let ctx = MgmtdContext::new();

    if let Some(local) = sync_args.local_node_id {
        let node_type: NodeType = sync_args.local_node_type.parse()?;
        ctx.nodes.get(node_type).set_local_node_id(local);
    }

    let authority = HttpAuthority::new(
        &sync_args.authority_url,
        Duration::from_secs(sync_args.timeout_secs),
    )?;
    let syncer = InternodeSyncer::new(ctx.clone(), Box::new(authority));

    let shutdown = Arc::new(ShutdownSignal::new());
    let syncer_handle = spawn_internode_syncer(
        syncer,
        Duration::from_secs(sync_args.interval_secs),
        shutdown.clone(),
    )?;

    let mgmt_ctx = ctx.clone();
    let first_wait = Duration::from_secs(sync_args.timeout_secs.max(sync_args.interval_secs) * 3);
    let waiter = tokio::task::spawn_blocking(move || {
        if mgmt_ctx.nodes.mgmt.wait_for_first_node(first_wait) {
            info!(
                storage_nodes = mgmt_ctx.nodes.storage.size(),
                targets = mgmt_ctx.target_states.len(),
                "first node list received from authority"
            );
        } else {
            warn!("no management node known yet");
        }
    });

    info!("syncing from {}", sync_args.authority_url);

    tokio::signal::ctrl_c().await?;

    shutdown.request();
    ctx.nodes.interrupt_waiters();
    let _ = waiter.await;
    if tokio::task::spawn_blocking(move || syncer_handle.join())
        .await?
        .is_err()
    {
        error!("internode syncer panicked");
    }

    Ok(())
}
