#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover::config::ServerConfig;
use drover::membership::StaticMembership;
use drover::raft::LocalRaft;
use drover::server::Server;

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Dev-mode bootstrap config with a short visibility timeout so tests
/// exercising redelivery stay fast.
pub fn dev_config(name: &str) -> ServerConfig {
    ServerConfig::dev(name).with_visibility_timeout(Duration::from_millis(200))
}

pub fn dev_server(
    config: ServerConfig,
) -> (
    Arc<Server>,
    Arc<LocalRaft>,
    Arc<StaticMembership>,
    CancellationToken,
) {
    let shutdown = CancellationToken::new();
    let (server, raft, membership) =
        Server::standalone(config, shutdown.clone()).expect("failed to start server");
    (server, raft, membership, shutdown)
}

/// Leadership must be acquired and the broker enabled within three
/// seconds of a single-node bootstrap.
pub async fn wait_for_leadership(server: &Arc<Server>) {
    assert!(
        wait_until(
            || server.is_leader() && server.eval_broker().enabled(),
            Duration::from_secs(3),
        )
        .await,
        "leadership not established within 3s"
    );
}
