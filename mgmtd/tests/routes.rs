mod common;

use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, StatusCode};

use ::common::schemas::{
    BuddyGroupsResponse, ChangeTargetStatesRequest, HeartbeatRequest, HeartbeatResponse,
    MapBuddyGroupRequest, MapBuddyGroupResponse, MapTargetRequest, NodeListResponse, NodeType,
    RemoveNodeRequest, RemoveNodeResponse, TargetMappingsResponse, TargetStatesReport,
    TargetStatesResponse,
};
use ::common::states::{ConsistencyState, ReachabilityState};

use crate::common::TestMgmtd;

fn client() -> Result<Client> {
    Ok(Client::builder().timeout(Duration::from_secs(10)).build()?)
}

fn heartbeat_req(node_type: NodeType, num_id: u16, node_id: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        node_type,
        num_id,
        node_id: node_id.to_string(),
        interfaces: vec!["127.0.0.1".into()],
        port_udp: 8003,
        port_tcp: 8003,
        feature_flags: vec![1],
        version: Some("7.4".into()),
        root_num_id: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_registers_and_lists_nodes() -> Result<()> {
    let mgmtd = TestMgmtd::new().await?;
    let client = client()?;

    let resp: HeartbeatResponse = client
        .post(format!("{}/nodes/heartbeat", mgmtd.url()))
        .json(&heartbeat_req(NodeType::Storage, 3, "storage03"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert!(resp.newly_added);

    let resp: HeartbeatResponse = client
        .post(format!("{}/nodes/heartbeat", mgmtd.url()))
        .json(&heartbeat_req(NodeType::Storage, 3, "storage03"))
        .send()
        .await?
        .json()
        .await?;
    assert!(!resp.newly_added);

    let list: NodeListResponse = client
        .get(format!("{}/nodes/storage", mgmtd.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(list.nodes.len(), 1);
    assert_eq!(list.nodes[0].node_id, "storage03");
    assert_eq!(list.nodes[0].version.as_deref(), Some("7.4"));

    let resp = client
        .get(format!("{}/nodes/nonsense", mgmtd.url()))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    mgmtd.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn meta_heartbeat_designates_root_once() -> Result<()> {
    let mgmtd = TestMgmtd::new().await?;
    let client = client()?;

    for (id, root) in [(1, 1), (2, 2)] {
        let mut req = heartbeat_req(NodeType::Meta, id, &format!("meta{:02}", id));
        req.root_num_id = Some(root);
        client
            .post(format!("{}/nodes/heartbeat", mgmtd.url()))
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
    }

    let list: NodeListResponse = client
        .get(format!("{}/nodes/meta", mgmtd.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(list.root_num_id, Some(1));
    assert_eq!(list.nodes.len(), 2);

    mgmtd.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_id_heartbeat_is_rejected() -> Result<()> {
    let mgmtd = TestMgmtd::new().await?;

    let resp = client()?
        .post(format!("{}/nodes/heartbeat", mgmtd.url()))
        .json(&heartbeat_req(NodeType::Storage, 0, "nobody"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(mgmtd.ctx.nodes.storage.size(), 0);

    mgmtd.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_reports_and_conditional_changes() -> Result<()> {
    let mgmtd = TestMgmtd::new().await?;
    let client = client()?;

    client
        .post(format!("{}/targets/states", mgmtd.url()))
        .json(&TargetStatesReport {
            target_ids: vec![1, 2],
            consistency_states: vec![ConsistencyState::Good, ConsistencyState::NeedsResync],
            set_online: true,
        })
        .send()
        .await?
        .error_for_status()?;

    let stale = client
        .post(format!("{}/targets/states/change", mgmtd.url()))
        .json(&ChangeTargetStatesRequest {
            target_ids: vec![1, 2],
            old_states: vec![ConsistencyState::Good, ConsistencyState::Good],
            new_states: vec![ConsistencyState::Bad, ConsistencyState::Good],
        })
        .send()
        .await?;
    assert_eq!(stale.status(), StatusCode::CONFLICT);

    client
        .post(format!("{}/targets/states/change", mgmtd.url()))
        .json(&ChangeTargetStatesRequest {
            target_ids: vec![2],
            old_states: vec![ConsistencyState::NeedsResync],
            new_states: vec![ConsistencyState::Good],
        })
        .send()
        .await?
        .error_for_status()?;

    let states: TargetStatesResponse = client
        .get(format!("{}/targets/states", mgmtd.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(
        states,
        TargetStatesResponse {
            target_ids: vec![1, 2],
            reachability_states: vec![ReachabilityState::Online, ReachabilityState::Online],
            consistency_states: vec![ConsistencyState::Good, ConsistencyState::Good],
        }
    );

    let malformed = client
        .post(format!("{}/targets/states", mgmtd.url()))
        .json(&TargetStatesReport {
            target_ids: vec![1, 2],
            consistency_states: vec![ConsistencyState::Good],
            set_online: true,
        })
        .send()
        .await?;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    mgmtd.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn targets_and_buddy_groups_admin() -> Result<()> {
    let mgmtd = TestMgmtd::new().await?;
    let client = client()?;

    // Mapping to an unknown node is refused.
    let resp = client
        .post(format!("{}/targets/map", mgmtd.url()))
        .json(&MapTargetRequest {
            target_id: 101,
            node_id: 1,
        })
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    client
        .post(format!("{}/nodes/heartbeat", mgmtd.url()))
        .json(&heartbeat_req(NodeType::Storage, 1, "storage01"))
        .send()
        .await?
        .error_for_status()?;

    for target_id in [101, 102] {
        client
            .post(format!("{}/targets/map", mgmtd.url()))
            .json(&MapTargetRequest {
                target_id,
                node_id: 1,
            })
            .send()
            .await?
            .error_for_status()?;
    }

    mgmtd
        .ctx
        .target_states
        .set_states_from_lists(&[101, 102], &[ConsistencyState::Good, ConsistencyState::Good], true)?;

    let mapped: MapBuddyGroupResponse = client
        .post(format!("{}/buddy-groups", mgmtd.url()))
        .json(&MapBuddyGroupRequest {
            group_id: 0,
            primary_target: 101,
            secondary_target: 102,
            allow_update: false,
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(mapped.group_id, 1);

    let unknown = client
        .post(format!("{}/buddy-groups", mgmtd.url()))
        .json(&MapBuddyGroupRequest {
            group_id: 0,
            primary_target: 101,
            secondary_target: 999,
            allow_update: false,
        })
        .send()
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let groups: BuddyGroupsResponse = client
        .get(format!("{}/buddy-groups", mgmtd.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(groups.group_ids, vec![1]);
    assert_eq!(groups.primary_targets, vec![101]);
    assert_eq!(groups.secondary_targets, vec![102]);

    let mappings: TargetMappingsResponse = client
        .get(format!("{}/targets/mappings", mgmtd.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(mappings.target_ids, vec![101, 102]);
    assert_eq!(mappings.node_ids, vec![1, 1]);

    let removed: RemoveNodeResponse = client
        .post(format!("{}/nodes/remove", mgmtd.url()))
        .json(&RemoveNodeRequest {
            node_type: NodeType::Storage,
            num_id: 1,
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert!(removed.was_active);
    assert_eq!(removed.unmapped_targets, vec![101, 102]);
    assert!(mgmtd.ctx.target_states.is_empty());

    let again = client
        .post(format!("{}/nodes/remove", mgmtd.url()))
        .json(&RemoveNodeRequest {
            node_type: NodeType::Storage,
            num_id: 1,
        })
        .send()
        .await?;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    mgmtd.shutdown().await
}
