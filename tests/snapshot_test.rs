use std::time::Duration;

mod common;
use common::sim::{Sim, SimConfig};

fn snapshot_config(seed: u64) -> SimConfig {
    let mut config = SimConfig::new(3, seed);
    config.raft.snapshot_threshold = 20;
    config.raft.snapshot_chunk_size = 256;
    config.raft.prefer_snapshot_replication_threshold = 50;
    config.max_segment_size = 1024;
    config
}

#[tokio::test(start_paused = true)]
async fn test_leader_snapshots_and_compacts() {
    common::init_tracing();
    let mut sim = Sim::new(snapshot_config(2)).await;
    sim.wait_for_leader(Duration::from_secs(5)).await;
    sim.run_with_load(Duration::from_secs(3), Duration::from_millis(20))
        .await;
    sim.run_for(Duration::from_millis(500)).await;

    for name in sim.members() {
        let state = sim.state(&name).unwrap();
        assert!(state.snapshot_index() > 0, "{} took no snapshot", name);
        assert!(
            state.log().first_index() > 1,
            "{} log was never compacted",
            name
        );
        // 压缩只删除快照覆盖的日志
        assert!(state.log().first_index() <= state.snapshot_index() + 1);
    }
    sim.assert_converged();
    sim.assert_committed_on_majority();
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_installs_snapshot() {
    common::init_tracing();
    let mut sim = Sim::new(snapshot_config(4)).await;
    let leader = sim.wait_for_leader(Duration::from_secs(5)).await;
    let follower = sim
        .members()
        .into_iter()
        .find(|name| *name != leader)
        .unwrap();

    sim.isolate(&follower);
    sim.run_with_load(Duration::from_secs(4), Duration::from_millis(20))
        .await;
    let leader_first = sim.state(&leader).unwrap().log().first_index();
    let follower_last = sim.state(&follower).unwrap().log().last_index();
    assert!(
        leader_first > follower_last + 1,
        "leader still holds {} for follower at {}",
        leader_first,
        follower_last
    );

    sim.heal_all();
    sim.run_for(Duration::from_secs(3)).await;

    let callbacks = sim.callbacks(&follower);
    let restores = callbacks.state_machine.restores();
    assert!(!restores.is_empty(), "follower never restored a snapshot");
    let state = sim.state(&follower).unwrap();
    assert!(state.health().is_ready(), "follower is {}", state.health());
    assert!(state.snapshot_index() >= restores[0].0);

    sim.assert_converged();
    sim.assert_log_matching();
}

#[tokio::test(start_paused = true)]
async fn test_restart_restores_latest_snapshot() {
    common::init_tracing();
    let mut sim = Sim::new(snapshot_config(6)).await;
    let leader = sim.wait_for_leader(Duration::from_secs(5)).await;
    sim.run_with_load(Duration::from_secs(2), Duration::from_millis(20))
        .await;
    sim.run_for(Duration::from_millis(500)).await;

    let follower = sim
        .members()
        .into_iter()
        .find(|name| *name != leader)
        .unwrap();
    let snapshot_index = sim.state(&follower).unwrap().snapshot_index();
    assert!(snapshot_index > 0);
    let blocks_before = sim.callbacks(&follower).state_machine.blocks();

    sim.crash(&follower);
    sim.restart(&follower).await;
    let callbacks = sim.callbacks(&follower);
    assert_eq!(callbacks.state_machine.restores()[0].0, snapshot_index);
    // 快照之后的已提交日志在启动时重放
    let replayed = callbacks.state_machine.blocks();
    assert!(replayed.len() >= blocks_before.len());
    assert!(replayed.starts_with(&blocks_before));

    sim.run_for(Duration::from_secs(1)).await;
    sim.assert_converged();
}
