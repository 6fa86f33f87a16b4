//! Daemon-side driver that mirrors the management daemon's node lists, target states, buddy groups
//! and target mappings into local stores.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use common::schemas::{
    BuddyGroupsResponse, NodeListResponse, NodeType, TargetMappingsResponse, TargetStatesResponse,
};
use common::states::ReachabilityState;
use common::trace_middleware::inject_trace_context_blocking;
use common::url_utils::sanitize_url;

use crate::core::node::Node;
use crate::core::registry::{DefaultSync, NodeRegistry, SyncStrategy};
use crate::core::shutdown::ShutdownSignal;
use crate::core::state::MgmtdContext;

/// Bulk downloads from the authoritative management daemon.
pub trait Authority: Send + Sync {
    fn download_nodes(&self, node_type: NodeType) -> anyhow::Result<NodeListResponse>;
    fn download_target_states(&self) -> anyhow::Result<TargetStatesResponse>;
    fn download_buddy_groups(&self) -> anyhow::Result<BuddyGroupsResponse>;
    fn download_target_mappings(&self) -> anyhow::Result<TargetMappingsResponse>;
}

pub struct HttpAuthority {
    base_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: sanitize_url(base_url)?,
            timeout,
            client: OnceLock::new(),
        })
    }

    fn get<R: DeserializeOwned>(&self, path: &str) -> anyhow::Result<R> {
        let client = match self.client.get() {
            Some(client) => client,
            None => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .context("failed to build http client")?;
                self.client.get_or_init(|| client)
            }
        };

        let url = format!("{}{}", self.base_url, path);
        let resp = inject_trace_context_blocking(client.get(&url))
            .send()
            .with_context(|| format!("GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {}", url))?;

        resp.json::<R>()
            .with_context(|| format!("bad response body from {}", url))
    }
}

impl Authority for HttpAuthority {
    fn download_nodes(&self, node_type: NodeType) -> anyhow::Result<NodeListResponse> {
        self.get(&format!("/nodes/{}", node_type))
    }

    fn download_target_states(&self) -> anyhow::Result<TargetStatesResponse> {
        self.get("/targets/states")
    }

    fn download_buddy_groups(&self) -> anyhow::Result<BuddyGroupsResponse> {
        self.get("/buddy-groups")
    }

    fn download_target_mappings(&self) -> anyhow::Result<TargetMappingsResponse> {
        self.get("/targets/mappings")
    }
}

/// Default add/remove, with a log line per membership change.
struct LoggingSync {
    inner: DefaultSync,
}

impl SyncStrategy for LoggingSync {
    fn remove(&mut self, registry: &NodeRegistry, num_id: u16) {
        info!(node_type = %registry.node_type(), num_id, "node dropped by authority");
        self.inner.remove(registry, num_id);
    }

    fn add(&mut self, registry: &NodeRegistry, node: Node) {
        info!(node_type = %registry.node_type(), node = %node, "node announced by authority");
        self.inner.add(registry, node);
    }

    fn update(&mut self, registry: &NodeRegistry, node: Node) {
        self.inner.update(registry, node);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub states_changed: bool,
}

pub struct InternodeSyncer {
    ctx: MgmtdContext,
    authority: Box<dyn Authority>,
}

impl InternodeSyncer {
    pub fn new(ctx: MgmtdContext, authority: Box<dyn Authority>) -> Self {
        Self { ctx, authority }
    }

    pub fn sync_once(&self) -> anyhow::Result<SyncReport> {
        let mut report = SyncReport::default();

        for node_type in NodeType::ALL {
            let list = self
                .authority
                .download_nodes(node_type)
                .with_context(|| format!("downloading {} nodes", node_type))?;
            let registry = self.ctx.nodes.get(node_type);

            let master: Vec<Node> = list.nodes.iter().map(Node::from_info).collect();
            let outcome =
                registry.sync_from_master_list_with(master, &mut LoggingSync { inner: DefaultSync });
            report.nodes_added += outcome.added.len();
            report.nodes_removed += outcome.removed.len();

            if node_type == NodeType::Meta
                && let Some(root) = list.root_num_id
            {
                registry.set_root_id(root, true);
            }
        }

        let states = self
            .authority
            .download_target_states()
            .context("downloading target states")?;
        report.states_changed = self.ctx.target_states.sync_states_from_lists(
            &states.target_ids,
            &states.reachability_states,
            &states.consistency_states,
        )?;

        let groups = self
            .authority
            .download_buddy_groups()
            .context("downloading buddy groups")?;
        self.ctx.buddy_groups.sync_groups_from_lists(
            &groups.group_ids,
            &groups.primary_targets,
            &groups.secondary_targets,
        )?;

        let mappings = self
            .authority
            .download_target_mappings()
            .context("downloading target mappings")?;
        self.ctx
            .target_mapper
            .sync_from_lists(&mappings.target_ids, &mappings.node_ids)?;

        debug!(?report, "sync finished");
        Ok(report)
    }
}

const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Grows the retry delay by half after a failed sync. Never shorter than `interval`; capped at
/// 30s unless `interval` itself is longer.
fn next_backoff(delay: Duration, interval: Duration) -> Duration {
    delay
        .max(interval)
        .mul_f32(1.5)
        .min(MAX_FAILURE_BACKOFF.max(interval))
}

/// Syncs immediately, then every `interval`. While the authority is unreachable all targets are
/// treated as probably-offline and retries back off.
pub fn spawn_internode_syncer(
    syncer: InternodeSyncer,
    interval: Duration,
    shutdown: Arc<ShutdownSignal>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("internode-syncer".into())
        .spawn(move || {
            info!(interval_ms = interval.as_millis() as u64, "internode syncer started");
            let mut delay = Duration::ZERO;

            while !shutdown.wait(delay) {
                match syncer.sync_once() {
                    Ok(_) => delay = interval,
                    Err(e) => {
                        warn!("sync with authority failed: {e:#}");
                        syncer
                            .ctx
                            .target_states
                            .set_all_states(ReachabilityState::ProbablyOffline);
                        delay = next_backoff(delay, interval);
                    }
                }
            }

            info!("internode syncer stopped");
        })
}
