//! Inter-node P2P cluster dispatch (spec §8 scenario E6): a `uid`
//! bound on one node is reachable from a sibling node's
//! `pushClusterSession`, routed over the peer Bridge Client link.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshline::{BridgeClient, BridgeClientConfig, ClusterDispatcher, FleetConfig, MessageServer, PeerNode, ServerConfig, Uid};
use serde_json::json;

fn fleet_with_one_peer(peer_port: u16) -> FleetConfig {
    let mut nodes = HashMap::new();
    nodes.insert(
        "cluster".to_owned(),
        vec![PeerNode {
            host: "127.0.0.1".to_owned(),
            inip: "127.0.0.1".to_owned(),
            port: peer_port,
            ssls: None,
        }],
    );
    FleetConfig {
        dir: "/tmp".to_owned(),
        env: "test".to_owned(),
        name: "node".to_owned(),
        host: "127.0.0.1".to_owned(),
        inip: "127.0.0.1".to_owned(),
        port: 0,
        ssls: None,
        links: vec!["cluster".to_owned()],
        nodes,
    }
}

#[tokio::test]
async fn push_cluster_session_reaches_only_the_node_holding_the_uid() {
    let (listener1, addr1) = support::bind().await;
    let (listener2, addr2) = support::bind().await;

    let secret = "s3cret".to_owned();
    let config1 = ServerConfig::default().with_secret(secret.clone());
    let config2 = ServerConfig::default().with_secret(secret);

    let cluster1 = ClusterDispatcher::from_fleet(&fleet_with_one_peer(addr2.port()), &config1, "/ws");
    let cluster2 = ClusterDispatcher::from_fleet(&fleet_with_one_peer(addr1.port()), &config2, "/ws");

    let server1 = MessageServer::new(config1, cluster1);
    let server2 = MessageServer::new(config2, cluster2);

    server2
        .set_router(
            "bind",
            Arc::new(|server, session, packet| {
                Box::pin(async move {
                    let uid = packet.message.as_str().unwrap_or_default().to_owned();
                    server.bind_uid(&session, Uid::new(uid), true).await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }),
        )
        .await;

    support::serve(server1.clone(), listener1).await;
    let url2 = support::serve(server2.clone(), listener2).await;

    // Give both peer Bridge Clients time to connect to each other.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let client = BridgeClient::spawn(BridgeClientConfig::new(url2));
    client.connect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_connected());

    let mut evt_rx = client.subscribe("evt").await;
    let bind_response = client.request("bind", json!("u1")).await.unwrap();
    assert!(bind_response.is_success());

    server1.cluster().push_cluster_session("cluster", "u1", "evt", json!({"x": 1})).await;

    let delivered = tokio::time::timeout(Duration::from_secs(2), evt_rx.recv())
        .await
        .expect("the session holding uid u1 did not receive the cluster push")
        .unwrap();
    assert_eq!(delivered, json!({"x": 1}));

    client.close();
}

#[tokio::test]
async fn push_cluster_session_for_an_unbound_uid_is_a_silent_noop() {
    let (listener1, addr1) = support::bind().await;
    let (listener2, addr2) = support::bind().await;

    let secret = "s3cret".to_owned();
    let config1 = ServerConfig::default().with_secret(secret.clone());
    let config2 = ServerConfig::default().with_secret(secret);

    let cluster1 = ClusterDispatcher::from_fleet(&fleet_with_one_peer(addr2.port()), &config1, "/ws");
    let cluster2 = ClusterDispatcher::from_fleet(&fleet_with_one_peer(addr1.port()), &config2, "/ws");

    let server1 = MessageServer::new(config1, cluster1);
    let server2 = MessageServer::new(config2, cluster2);

    support::serve(server1.clone(), listener1).await;
    support::serve(server2.clone(), listener2).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // No session anywhere ever binds "ghost": this must not panic or
    // close anything on either node.
    server1.cluster().push_cluster_session("cluster", "ghost", "evt", json!(1)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server2.state().bound_count().await, 0);
}
