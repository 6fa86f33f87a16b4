use axum::{
    Router,
    extract::{Json, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use tracing::info;

use common::api_error::ApiError;
use common::schemas::{
    BuddyGroupsResponse, ChangeTargetStatesRequest, HeartbeatRequest, HeartbeatResponse,
    MapBuddyGroupRequest, MapBuddyGroupResponse, MapTargetRequest, NodeListResponse, NodeType,
    RemoveNodeRequest, RemoveNodeResponse, TargetMappingsResponse, TargetStatesReport,
    TargetStatesResponse,
};
use common::trace_middleware::trace_context_middleware;

use crate::core::node::Node;
use crate::core::state::MgmtdContext;

pub fn build_router(ctx: MgmtdContext) -> Router {
    Router::new()
        .route("/nodes/heartbeat", post(heartbeat))
        .route("/nodes/remove", post(remove_node))
        .route("/nodes/{node_type}", get(list_nodes))
        .route("/targets/states", post(report_target_states).get(list_target_states))
        .route("/targets/states/change", post(change_target_states))
        .route("/targets/mappings", get(list_target_mappings))
        .route("/targets/map", post(map_target))
        .route("/buddy-groups", get(list_buddy_groups).post(map_buddy_group))
        .layer(middleware::from_fn(trace_context_middleware))
        .with_state(ctx)
}

// POST /nodes/heartbeat
/// Registers a node on its first heartbeat and refreshes it on every later one.
#[tracing::instrument(name = "mgmtd.nodes.heartbeat", skip(ctx, req), fields(node_type = %req.node_type, num_id = req.num_id))]
pub async fn heartbeat(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    if req.num_id == 0 {
        return Err(ApiError::BadRequest("numeric node id must not be 0".into()));
    }

    let registry = ctx.nodes.get(req.node_type);
    let newly_added = registry.add_or_update(Node::from_heartbeat(&req));

    if req.node_type == NodeType::Meta
        && let Some(root) = req.root_num_id
        && registry.set_root_id(root, false)
    {
        info!(root, "root metadata node designated by heartbeat");
    }

    Ok(Json(HeartbeatResponse { newly_added }))
}

// POST /nodes/remove
#[tracing::instrument(name = "mgmtd.nodes.remove", skip(ctx))]
pub async fn remove_node(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<RemoveNodeRequest>,
) -> Result<Json<RemoveNodeResponse>, ApiError> {
    let was_active = ctx.nodes.get(req.node_type).mark_removed(req.num_id);

    let unmapped_targets = if req.node_type == NodeType::Storage {
        ctx.target_mapper.unmap_node(req.num_id)
    } else {
        Vec::new()
    };
    for &target_id in &unmapped_targets {
        ctx.target_states.remove_target(target_id);
    }

    if !was_active && unmapped_targets.is_empty() {
        return Err(ApiError::UnknownNode);
    }

    Ok(Json(RemoveNodeResponse {
        was_active,
        unmapped_targets,
    }))
}

// GET /nodes/{node_type}
#[tracing::instrument(name = "mgmtd.nodes.list", skip(ctx))]
pub async fn list_nodes(
    Path(node_type): Path<String>,
    State(ctx): State<MgmtdContext>,
) -> Result<Json<NodeListResponse>, ApiError> {
    let node_type: NodeType = node_type
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    let registry = ctx.nodes.get(node_type);

    Ok(Json(NodeListResponse {
        nodes: registry.node_infos(),
        root_num_id: registry.root_id(),
    }))
}

// POST /targets/states
/// Routine state report; applied unconditionally.
#[tracing::instrument(name = "mgmtd.targets.report", skip(ctx, req), fields(targets = req.target_ids.len()))]
pub async fn report_target_states(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<TargetStatesReport>,
) -> Result<StatusCode, ApiError> {
    ctx.target_states
        .set_states_from_lists(&req.target_ids, &req.consistency_states, req.set_online)?;
    Ok(StatusCode::OK)
}

// POST /targets/states/change
/// Conditional transition; 409 tells the caller to re-read the states and retry.
#[tracing::instrument(name = "mgmtd.targets.change", skip(ctx, req), fields(targets = req.target_ids.len()))]
pub async fn change_target_states(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<ChangeTargetStatesRequest>,
) -> Result<StatusCode, ApiError> {
    ctx.target_states.change_states_from_lists(
        &req.target_ids,
        &req.old_states,
        &req.new_states,
        Some(ctx.buddy_groups.as_ref()),
    )?;
    Ok(StatusCode::OK)
}

// GET /targets/states
#[tracing::instrument(name = "mgmtd.targets.states", skip(ctx))]
pub async fn list_target_states(State(ctx): State<MgmtdContext>) -> Json<TargetStatesResponse> {
    let (target_ids, reachability_states, consistency_states) =
        ctx.target_states.get_states_as_lists();
    Json(TargetStatesResponse {
        target_ids,
        reachability_states,
        consistency_states,
    })
}

// GET /targets/mappings
#[tracing::instrument(name = "mgmtd.targets.mappings", skip(ctx))]
pub async fn list_target_mappings(State(ctx): State<MgmtdContext>) -> Json<TargetMappingsResponse> {
    let (target_ids, node_ids) = ctx.target_mapper.targets_as_lists();
    Json(TargetMappingsResponse {
        target_ids,
        node_ids,
    })
}

// POST /targets/map
#[tracing::instrument(name = "mgmtd.targets.map", skip(ctx))]
pub async fn map_target(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<MapTargetRequest>,
) -> Result<StatusCode, ApiError> {
    if !ctx.nodes.storage.is_active(req.node_id) {
        return Err(ApiError::UnknownNode);
    }
    ctx.target_mapper.map_target(req.target_id, req.node_id)?;
    Ok(StatusCode::OK)
}

// GET /buddy-groups
#[tracing::instrument(name = "mgmtd.buddy_groups.list", skip(ctx))]
pub async fn list_buddy_groups(State(ctx): State<MgmtdContext>) -> Json<BuddyGroupsResponse> {
    let (group_ids, primary_targets, secondary_targets) = ctx.buddy_groups.groups_as_lists();
    Json(BuddyGroupsResponse {
        group_ids,
        primary_targets,
        secondary_targets,
    })
}

// POST /buddy-groups
#[tracing::instrument(name = "mgmtd.buddy_groups.map", skip(ctx))]
pub async fn map_buddy_group(
    State(ctx): State<MgmtdContext>,
    Json(req): Json<MapBuddyGroupRequest>,
) -> Result<Json<MapBuddyGroupResponse>, ApiError> {
    for target in [req.primary_target, req.secondary_target] {
        if ctx.target_mapper.node_of(target).is_none() {
            return Err(ApiError::UnknownTarget);
        }
    }

    let group_id = ctx.buddy_groups.map_group(
        req.group_id,
        req.primary_target,
        req.secondary_target,
        req.allow_update,
    )?;
    Ok(Json(MapBuddyGroupResponse { group_id }))
}
