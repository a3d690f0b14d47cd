//! End-to-end cluster tests: full nodes with real server loops, channel
//! transport and durable engines in temp directories.

use std::time::Duration;

use replikv::core::raft_server::RaftError;
use replikv::testing::TestCluster;
use replikv::{ClientProxy, Command};

const LEADER_WAIT: Duration = Duration::from_secs(5);

/// Route node logs through the test harness; honors RUST_LOG for debugging
/// failed runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Submit with a few retries: right after an election the role channel can
/// lag the core by a moment, and a client would retry anyway.
async fn submit_retrying(
    proxy: &ClientProxy,
    command: Command,
) -> Result<Option<Vec<u8>>, RaftError> {
    let mut last = Err(RaftError::NotLeader { leader_hint: None });
    for _ in 0..20 {
        match proxy.commit_state(command.clone()).await {
            Ok(v) => return Ok(v),
            Err(e) => last = Err(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    last
}

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_put_delete_get() {
    init_tracing();
    let cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    // Put returns the written value and becomes readable locally
    let result = submit_retrying(&proxy, Command::put("name", "alice")).await;
    assert_eq!(result.unwrap(), Some(b"alice".to_vec()));
    assert_eq!(proxy.read(b"name").unwrap(), Some(b"alice".to_vec()));
    assert_eq!(proxy.get_current_state(), Some(b"alice".to_vec()));

    // Overwrite
    let result = proxy.commit_state(Command::put("name", "bob")).await;
    assert_eq!(result.unwrap(), Some(b"bob".to_vec()));
    assert_eq!(proxy.read(b"name").unwrap(), Some(b"bob".to_vec()));

    // Delete; reading the key afterwards finds nothing
    let result = proxy.commit_state(Command::delete("name")).await;
    assert_eq!(result.unwrap(), None);
    assert_eq!(proxy.read(b"name").unwrap(), None);

    // Reading a key that never existed is None, not an error
    assert_eq!(proxy.read(b"missing").unwrap(), None);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_is_atomic_across_members() {
    init_tracing();
    let cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    submit_retrying(&proxy, Command::put("a", "old"))
        .await
        .unwrap();

    let batch = Command::Batch {
        ops: vec![
            replikv::BatchOp::Put {
                key: b"b".to_vec(),
                value: b"new".to_vec(),
            },
            replikv::BatchOp::Delete { key: b"a".to_vec() },
        ],
    };
    proxy.commit_state(batch).await.unwrap();

    assert_eq!(proxy.read(b"a").unwrap(), None);
    assert_eq!(proxy.read(b"b").unwrap(), Some(b"new".to_vec()));

    // Followers converge once the commit reaches them via heartbeat
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    'outer: loop {
        let mut converged = true;
        for node in &cluster.nodes {
            let sm = node.state_machine.lock();
            if sm.get(b"b").unwrap() != Some(b"new".to_vec()) || sm.get(b"a").unwrap().is_some() {
                converged = false;
            }
        }
        if converged {
            break 'outer;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "followers did not converge"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_commits_converge_on_all_members() {
    init_tracing();
    let cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    // A long run of sequential writes to the same key; the last write wins
    // everywhere
    let total = 1000u32;
    let mut last_result = None;
    for i in 1..=total {
        let value = i.to_string();
        let result = submit_retrying(&proxy, Command::put("counter", value.clone()))
            .await
            .unwrap_or_else(|e| panic!("commit {} failed: {}", i, e));
        last_result = result;
    }
    assert_eq!(last_result, Some(b"1000".to_vec()));

    // Every member converges to the final value
    let expected = Some(b"1000".to_vec());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let converged = cluster
            .nodes
            .iter()
            .all(|node| node.state_machine.lock().get(b"counter").unwrap() == expected);
        if converged {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "members did not converge to the final value"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Full keyspace images match across members
    let reference = cluster.nodes[0]
        .state_machine
        .lock()
        .engine()
        .export()
        .unwrap();
    for node in &cluster.nodes[1..] {
        let image = node.state_machine.lock().engine().export().unwrap();
        assert_eq!(image, reference);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_rejects_writes_with_leader_hint() {
    init_tracing();
    let cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let leader_id = cluster.nodes[leader].id;

    // Let a round of heartbeats and role publications go by so followers
    // know who leads
    tokio::time::sleep(Duration::from_millis(500)).await;

    let follower = cluster.find_follower().await.expect("no follower");
    let proxy = cluster.nodes[follower].proxy();

    let err = proxy
        .commit_state(Command::put("x", "1"))
        .await
        .expect_err("follower must not accept writes");
    match err {
        RaftError::NotLeader { leader_hint } => {
            assert_eq!(leader_hint, Some(leader_id), "hint should name the leader");
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    // The write never happened anywhere
    assert_eq!(proxy.read(b"x").unwrap(), None);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_verified_read_on_leader() {
    init_tracing();
    let cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    submit_retrying(&proxy, Command::put("k", "v")).await.unwrap();

    // A majority heartbeat round proves no newer leader exists, so the
    // local read that follows reflects every committed write
    assert_eq!(proxy.raft().confirm_leadership().await, Ok(true));
    assert_eq!(proxy.read(b"k").unwrap(), Some(b"v".to_vec()));

    // Followers refuse the confirmation outright
    let follower = cluster.find_follower().await.expect("no follower");
    let result = cluster.nodes[follower]
        .proxy()
        .raft()
        .confirm_leadership()
        .await;
    assert!(matches!(result, Err(RaftError::NotLeader { .. })));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_committed_data_survives_leader_failover() {
    init_tracing();
    let mut cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    submit_retrying(&proxy, Command::put("durable", "yes"))
        .await
        .unwrap();

    // Wait for the commit to reach the followers before killing the leader
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let replicated = cluster
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != leader)
            .all(|(_, n)| n.state_machine.lock().get(b"durable").unwrap().is_some());
        if replicated {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "commit never spread");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown_node(leader).await;

    // A new leader emerges from the survivors
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let new_leader = loop {
        if let Some(idx) = cluster.find_leader().await {
            if idx != leader {
                break idx;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no new leader after failover"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let proxy = cluster.nodes[new_leader].proxy();

    // The committed write survived
    assert_eq!(proxy.read(b"durable").unwrap(), Some(b"yes".to_vec()));

    // And the new leader accepts fresh writes
    let result = submit_retrying(&proxy, Command::put("after", "failover")).await;
    assert_eq!(result.unwrap(), Some(b"failover".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_without_majority_is_not_committed() {
    init_tracing();
    let mut cluster = TestCluster::new().await;
    let leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("no leader elected");
    let proxy = cluster.nodes[leader].proxy();

    submit_retrying(&proxy, Command::put("before", "partition"))
        .await
        .unwrap();

    // Kill both followers: the leader keeps its role but has no majority
    let followers: Vec<usize> = (0..cluster.nodes.len()).filter(|&i| i != leader).collect();
    for idx in followers {
        cluster.shutdown_node(idx).await;
    }

    // The write is accepted into the log but can never commit
    let err = proxy
        .commit_state(Command::put("orphan", "1"))
        .await
        .expect_err("write must not commit without a majority");
    assert_eq!(err, RaftError::NotCommitted);

    // The un-acked entry was never applied
    assert_eq!(proxy.read(b"orphan").unwrap(), None);
    assert_eq!(proxy.read(b"before").unwrap(), Some(b"partition".to_vec()));

    cluster.shutdown().await;
}
