use std::time::Duration;

use tokio::time::timeout;

use weft_core::auth::{SignedPayload, Token};
use weft_core::codec::Packet;
use weft_core::device::FrameQueue;
use weft_core::ip::ETHERTYPE_IPV4;
use weft_core::types::{unix_seconds_f64, Registration};

use crate::common::{ipv4_frame, MeshNode, TestMesh, CLUSTER_SECRET};

const WINDOW: Duration = Duration::from_secs(60);
const EARLY: Duration = Duration::from_secs(5);

fn cluster_signed(issuer: &str, audience: &str, body: &[u8]) -> String {
    Token::cluster(CLUSTER_SECRET)
        .sign(issuer, audience, SignedPayload::Bytes(body), WINDOW, EARLY)
        .expect("sign")
}

async fn post_registration(url: &str, body: Vec<u8>, authorization: Option<String>) -> u16 {
    let mut request = reqwest::Client::new()
        .post(format!("{}/control/v0/registrations/register", url))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(authorization) = authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }
    request.send().await.expect("send").status().as_u16()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registration_from_self_is_misdirected() {
    let mesh = TestMesh::new(1).await;
    let node = &mesh.nodes[0];

    // A node's own advertisement coming back at it, as a bad seed list or a
    // load balancer loop would produce.
    let doc = Registration::new(node.manager.local().clone(), Vec::new());
    let body = serde_json::to_vec(&doc).unwrap();
    let authorization = cluster_signed("node-0", "node-0", &body);

    let status = post_registration(&node.url, body, Some(authorization)).await;
    assert_eq!(status, 421);
    assert!(node.manager.pool().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spoofed_id_is_rejected() {
    let mesh = TestMesh::new(2).await;
    mesh.wait_converged().await;

    // Claim a different id while advertising node-1's listen URL; the
    // responder resolves the URL and sees the mismatch.
    let mut info = mesh.nodes[1].manager.local().clone();
    info.id = "impostor".to_string();
    let doc = Registration::new(info, Vec::new());
    let body = serde_json::to_vec(&doc).unwrap();
    let authorization = cluster_signed("impostor", "node-0", &body);

    let status = post_registration(&mesh.nodes[0].url, body, Some(authorization)).await;
    assert_eq!(status, 400);
    assert!(!mesh.nodes[0].manager.pool().contains("impostor"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_credential_is_unauthorized() {
    let mesh = TestMesh::new(2).await;
    let doc = Registration::new(mesh.nodes[1].manager.local().clone(), Vec::new());
    let body = serde_json::to_vec(&doc).unwrap();

    let status = post_registration(&mesh.nodes[0].url, body, None).await;
    assert_eq!(status, 401);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_cluster_secret_is_unauthorized() {
    let mesh = TestMesh::new(2).await;
    let doc = Registration::new(mesh.nodes[1].manager.local().clone(), Vec::new());
    let body = serde_json::to_vec(&doc).unwrap();
    let authorization = Token::cluster("not-the-secret")
        .sign("node-1", "node-0", SignedPayload::Bytes(&body), WINDOW, EARLY)
        .unwrap();

    let status = post_registration(&mesh.nodes[0].url, body, Some(authorization)).await;
    assert_eq!(status, 401);
}

/// Post a packet body to `target`'s receive endpoint for `sender_id`,
/// signed with `sender`'s live session toward the target.
async fn post_packet(
    sender: &MeshNode,
    sender_id: &str,
    target: &MeshNode,
    packet: &Packet,
) -> reqwest::Response {
    let remote = sender
        .manager
        .pool()
        .find(&target.id)
        .expect("sender knows the target");
    let authorization = remote
        .session()
        .authorization_for_request(remote.as_ref(), SignedPayload::Packet(packet))
        .await
        .expect("sign packet");
    reqwest::Client::new()
        .post(format!("{}/control/v0/packet/rx/{}", target.url, sender_id))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::AUTHORIZATION, authorization)
        .body(serde_json::to_vec(&packet.to_json()).unwrap())
        .send()
        .await
        .expect("send packet")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forged_sender_identity_is_dropped() {
    let mesh = TestMesh::new(3).await;
    mesh.wait_converged().await;

    // node-1 forges a packet that is internally consistent for node-2 (its
    // tunnel source address and origin id both match) and signs it with
    // node-1's own perfectly valid session toward node-0.
    let frame = ipv4_frame(MeshNode::tunnel_addr(2), MeshNode::tunnel_addr(0));
    let packet = Packet::new(ETHERTYPE_IPV4, frame, "node-2", unix_seconds_f64()).unwrap();
    let response = post_packet(&mesh.nodes[1], "node-1", &mesh.nodes[0], &packet).await;

    // Drops are counted, never surfaced to the sender.
    assert_eq!(response.status().as_u16(), 204);

    let metrics = reqwest::get(format!("{}/metrics", mesh.nodes[0].url))
        .await
        .expect("metrics")
        .text()
        .await
        .expect("metrics body");
    assert!(
        metrics.contains("identity_conflict"),
        "forged packet was not counted as an identity conflict"
    );
    assert_eq!(mesh.nodes[0].device.outbound().try_pop().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_packet_receipt_is_signed_and_delivered() {
    let mesh = TestMesh::new(2).await;
    mesh.wait_converged().await;

    let frame = ipv4_frame(MeshNode::tunnel_addr(1), MeshNode::tunnel_addr(0));
    let packet = Packet::new(ETHERTYPE_IPV4, frame.clone(), "node-1", unix_seconds_f64()).unwrap();
    let response = post_packet(&mesh.nodes[1], "node-1", &mesh.nodes[0], &packet).await;

    assert_eq!(response.status().as_u16(), 204);
    assert!(
        response
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .is_some(),
        "receipt carries no authorization header"
    );

    let delivered = timeout(Duration::from_secs(5), mesh.nodes[0].device.outbound().pop())
        .await
        .expect("delivery timed out")
        .expect("device closed");
    assert_eq!(delivered, frame);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_packet_from_unknown_node_is_not_found() {
    let mesh = TestMesh::new(1).await;
    let status = reqwest::Client::new()
        .post(format!(
            "{}/control/v0/packet/rx/ghost",
            mesh.nodes[0].url
        ))
        .header(reqwest::header::AUTHORIZATION, "irrelevant")
        .body("{}")
        .send()
        .await
        .expect("send")
        .status()
        .as_u16();
    assert_eq!(status, 404);
}
