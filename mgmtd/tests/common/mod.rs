#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::Result;
use axum::Router;
use axum::extract::Json;
use axum::routing::post;
use axum_server::Server;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::schemas::{NodeType, OpResult, SetConsistencyStatesRequest, SetConsistencyStatesResponse};
use common::states::{CombinedTargetState, ConsistencyState, ReachabilityState};
use mgmtd::core::error::StoreError;
use mgmtd::core::messenger::NodeMessenger;
use mgmtd::core::node::Node;
use mgmtd::core::routes::build_router;
use mgmtd::core::state::MgmtdContext;

pub fn mk_node(num_id: u16, string_id: &str, node_type: NodeType) -> Node {
    Node::new(num_id, string_id, node_type, vec!["127.0.0.1".into()], 8003, 8003)
}

pub fn online(consistency: ConsistencyState) -> CombinedTargetState {
    CombinedTargetState::new(ReachabilityState::Online, consistency)
}

/// Answers every consistency RPC with a fixed outcome and records what it was asked.
pub struct TestMessenger {
    outcome: Result<OpResult, String>,
    pub calls: Mutex<Vec<(u16, SetConsistencyStatesRequest)>>,
}

impl TestMessenger {
    pub fn answering(result: OpResult) -> Self {
        Self {
            outcome: Ok(result),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            outcome: Err(msg.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl NodeMessenger for TestMessenger {
    fn set_consistency_states(
        &self,
        node: &Node,
        req: &SetConsistencyStatesRequest,
    ) -> Result<SetConsistencyStatesResponse, StoreError> {
        self.calls.lock().unwrap().push((node.num_id(), req.clone()));
        match &self.outcome {
            Ok(result) => Ok(SetConsistencyStatesResponse { result: *result }),
            Err(msg) => Err(StoreError::Remote(msg.clone())),
        }
    }
}

pub struct TestServer {
    pub handle: JoinHandle<Result<(), anyhow::Error>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub addr: SocketAddr,
    pub url: String,
}

impl TestServer {
    pub async fn start(app: Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = Server::from_tcp(listener.into_std()?).serve(app.into_make_service());

            tokio::select! {
                res = server => res.map_err(anyhow::Error::from),
                _ = shutdown_rx.changed() => Ok(()),
            }
        });

        Ok(TestServer {
            handle,
            shutdown_tx,
            addr,
            url,
        })
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
        Ok(())
    }
}

pub struct TestMgmtd {
    pub server: TestServer,
    pub ctx: MgmtdContext,
}

impl TestMgmtd {
    pub async fn new() -> Result<Self> {
        let ctx = MgmtdContext::new();
        let server = TestServer::start(build_router(ctx.clone())).await?;
        Ok(TestMgmtd { server, ctx })
    }

    pub fn url(&self) -> &str {
        &self.server.url
    }

    pub async fn shutdown(self) -> Result<()> {
        self.server.shutdown().await
    }
}

/// Minimal storage daemon that accepts consistency updates with a fixed result.
pub async fn start_fake_storage(result: OpResult) -> Result<TestServer> {
    let app = Router::new().route(
        "/targets/consistency",
        post(move |Json(_req): Json<SetConsistencyStatesRequest>| async move {
            Json(SetConsistencyStatesResponse { result })
        }),
    );
    TestServer::start(app).await
}
