//! Automatic recovery: repeated probe failures drive exactly one
//! restart through the lifecycle controller.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{install_stub_launcher, test_config, FakeMultiplexer};
use overseer::{
    AgentConfig, AgentStatus, AgentType, CreateAgentSpec, EventKind, LifecycleController,
};

fn spec(id: &str) -> CreateAgentSpec {
    CreateAgentSpec {
        id: id.to_string(),
        agent_type: AgentType::Worker,
        project_id: "p".to_string(),
        config: AgentConfig {
            capabilities: vec!["work".to_string()],
            max_concurrent_tasks: 1,
            ..Default::default()
        },
        working_dir: None,
    }
}

async fn probing_controller(root: &Path) -> (Arc<LifecycleController>, Arc<FakeMultiplexer>) {
    let mut config = test_config(root);
    config.health.health_interval_ms = 50;
    config.health.health_timeout_ms = 200;
    config.health.health_max_failures = 3;
    install_stub_launcher(&config);

    let mux = Arc::new(FakeMultiplexer::new(
        config.state_dir.clone(),
        Duration::from_millis(30),
    ));
    let controller = LifecycleController::new(config, mux.clone())
        .await
        .unwrap();
    (controller, mux)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_agent_restarted_once() {
    let root = tempfile::TempDir::new().unwrap();
    let (controller, mux) = probing_controller(root.path()).await;
    let mut events = controller.events();

    controller.create_agent(spec("d1")).await.unwrap();
    controller.start_agent("d1").await.unwrap();

    // Garble the state file: every probe now fails.
    let state_file = root.path().join("state").join("agent-d1.json");
    std::fs::write(&state_file, "<<garbage>>").unwrap();

    // Three failing probes trip the monitor; the controller restarts
    // the agent, and the fake launcher rewrites a healthy state file.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut unhealthy = 0;
    let mut started = 0;
    let mut recovered = 0;
    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            EventKind::AgentUnhealthy { .. } => unhealthy += 1,
            EventKind::AgentStarted { .. } => started += 1,
            EventKind::AgentRecovered { .. } => recovered += 1,
            EventKind::AgentFailed { .. } => failed += 1,
            _ => {}
        }
    }

    assert_eq!(unhealthy, 1, "agent_unhealthy must fire exactly once");
    assert_eq!(started, 2, "initial start plus exactly one restart");
    assert_eq!(recovered, 1, "agent_recovered must fire exactly once");
    assert_eq!(failed, 0);

    assert_eq!(
        controller.get_agent("d1").await.unwrap().status,
        AgentStatus::Running
    );
    // Two launcher start commands hit the session: boot and restart.
    assert_eq!(mux.exec_count().await, 2);

    controller.shutdown().await.unwrap();
}
