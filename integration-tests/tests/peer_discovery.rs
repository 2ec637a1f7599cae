use std::time::Duration;

use crate::common::{wait_until, TestMesh};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transitive_discovery_through_seed() {
    // Nodes 1 and 2 only know the seed; they must learn about each other
    // through it.
    let mesh = TestMesh::new(3).await;
    mesh.wait_converged().await;

    assert!(mesh.nodes[1].manager.pool().contains("node-2"));
    assert!(mesh.nodes[2].manager.pool().contains("node-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_node_is_evicted() {
    let mesh = TestMesh::new(2).await;
    mesh.wait_converged().await;

    mesh.nodes[1].stop();

    let pool = mesh.nodes[0].manager.pool().clone();
    wait_until(
        "node-0 evicts the dead peer",
        Duration::from_secs(15),
        || !pool.contains("node-1"),
    )
    .await;
}
