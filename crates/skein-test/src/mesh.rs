//! End-to-end mesh scenarios
//!
//! A [`Mesh`] is a set of live nodes linked over loopback. The tests below
//! cover:
//! - Local write and read
//! - Replication along subscriptions, exactly once per node
//! - Loop suppression in mutual subscriptions, chains and rings
//! - Publish intents
//! - Authorization of raw transport clients
//! - Fan-out reads with healthy, unauthenticated, refusing and silent peers

use std::sync::Arc;

use skein_core::{ChannelName, SkeinError, SkeinResult, SubscriptionIntent};
use skein_node::Node;

use crate::harness::{peer_key, spawn_node};

/// Live nodes, shut down on drop
pub struct Mesh {
    nodes: Vec<Arc<Node>>,
}

impl Mesh {
    pub async fn start(names: &[&str]) -> SkeinResult<Self> {
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            nodes.push(spawn_node(name).await?);
        }
        Ok(Mesh { nodes })
    }

    /// Nodes where each one subscribes to `channel` on its predecessor
    pub async fn chain(names: &[&str], channel: &str) -> SkeinResult<Self> {
        let mesh = Self::start(names).await?;
        for i in 1..mesh.len() {
            mesh.subscribe(i, i - 1, channel).await?;
        }
        Ok(mesh)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Open a link from node `from` to node `to`
    pub async fn link(&self, from: usize, to: usize, intents: Vec<SubscriptionIntent>) -> SkeinResult<()> {
        let target = peer_key(&self.nodes[to]);
        self.nodes[from].connect_to_peer(target, intents).await.map(|_| ())
    }

    /// Node `from` stores everything written to `channel` on node `to`
    pub async fn subscribe(&self, from: usize, to: usize, channel: &str) -> SkeinResult<()> {
        self.link(from, to, vec![SubscriptionIntent::new(channel).subscribe()])
            .await
    }

    pub fn write(&self, index: usize, channel: &str, data: serde_json::Value) -> SkeinResult<()> {
        self.nodes[index].write(&ChannelName::from(channel), data)
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// True when `error` is a refused subscription
pub fn is_refused(error: &SkeinError) -> bool {
    matches!(error, SkeinError::SubscriptionRefused { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use serde_json::json;
    use skein_core::{has_seen, Envelope, FederatedEntry, NodeName};

    use crate::harness::{
        eventually, init_test_logging, logged_in_client, node_config, raw_client, settles_at,
        spawn_node_with, stored, StubBehavior, StubPeer, SETTLE,
    };

    const QUIET: Duration = Duration::from_millis(300);

    fn servers(entries: &[FederatedEntry]) -> BTreeSet<String> {
        entries
            .iter()
            .filter_map(|entry| entry.server())
            .map(|name| name.as_str().to_string())
            .collect()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_local_write_and_read() {
        init_test_logging();
        let mesh = Mesh::start(&["a"]).await.unwrap();

        mesh.write(0, "sensors", json!({"temp": 72})).unwrap();
        mesh.write(0, "sensors", json!({"temp": 73})).unwrap();

        let records = mesh.node(0).read(&"sensors".into()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, r#"{"temp":72}"#);
        assert_eq!(records[1].value, r#"{"temp":73}"#);
        assert!(records[0].date <= records[1].date);
        assert_eq!(stored(mesh.node(0), "elsewhere"), 0);
    }

    #[tokio::test]
    async fn test_subscriber_stores_remote_write_once() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.subscribe(0, 1, "sensors").await.unwrap();

        mesh.write(1, "sensors", json!({"temp": 72})).unwrap();

        assert!(settles_at(mesh.node(0), "sensors", 1, QUIET).await);
        assert_eq!(stored(mesh.node(1), "sensors"), 1);

        let copy = mesh.node(0).read(&"sensors".into()).unwrap();
        assert_eq!(copy[0].value, r#"{"temp":72}"#);
        // writes on the subscriber do not flow back
        mesh.write(0, "sensors", json!({"temp": 1})).unwrap();
        tokio::time::sleep(QUIET).await;
        assert_eq!(stored(mesh.node(1), "sensors"), 1);
    }

    #[tokio::test]
    async fn test_other_channels_are_not_replicated() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.subscribe(0, 1, "sensors").await.unwrap();

        mesh.write(1, "alarms", json!("fire")).unwrap();
        tokio::time::sleep(QUIET).await;
        assert_eq!(stored(mesh.node(0), "alarms"), 0);
    }

    #[tokio::test]
    async fn test_chain_stores_once_per_node() {
        init_test_logging();
        let mesh = Mesh::chain(&["a", "b", "c"], "sensors").await.unwrap();

        mesh.write(0, "sensors", json!({"temp": 72})).unwrap();

        for node in mesh.nodes() {
            assert!(
                settles_at(node, "sensors", 1, QUIET).await,
                "{} stored {}",
                node.name(),
                stored(node, "sensors")
            );
        }
        let tail = mesh.node(2).read(&"sensors".into()).unwrap();
        assert_eq!(tail[0].value, r#"{"temp":72}"#);
    }

    #[tokio::test]
    async fn test_mutual_subscription_does_not_echo() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.subscribe(0, 1, "sensors").await.unwrap();
        mesh.subscribe(1, 0, "sensors").await.unwrap();

        mesh.write(0, "sensors", json!(1)).unwrap();
        assert!(settles_at(mesh.node(1), "sensors", 1, QUIET).await);
        assert_eq!(stored(mesh.node(0), "sensors"), 1);

        mesh.write(1, "sensors", json!(2)).unwrap();
        assert!(settles_at(mesh.node(0), "sensors", 2, QUIET).await);
        assert_eq!(stored(mesh.node(1), "sensors"), 2);
    }

    #[tokio::test]
    async fn test_ring_delivers_once_and_stops() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b", "c"]).await.unwrap();
        // a <- b <- c <- a
        mesh.subscribe(0, 1, "sensors").await.unwrap();
        mesh.subscribe(1, 2, "sensors").await.unwrap();
        mesh.subscribe(2, 0, "sensors").await.unwrap();

        mesh.write(0, "sensors", json!("once")).unwrap();

        for node in mesh.nodes() {
            assert!(
                settles_at(node, "sensors", 1, QUIET).await,
                "{} stored {}",
                node.name(),
                stored(node, "sensors")
            );
        }
    }

    #[tokio::test]
    async fn test_publish_intent_forwards_local_writes() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.link(0, 1, vec![SubscriptionIntent::new("sensors").publish()])
            .await
            .unwrap();

        mesh.write(0, "sensors", json!({"temp": 72})).unwrap();

        assert!(settles_at(mesh.node(1), "sensors", 1, QUIET).await);
        assert_eq!(stored(mesh.node(0), "sensors"), 1);
        let copy = mesh.node(1).read(&"sensors".into()).unwrap();
        assert_eq!(copy[0].value, r#"{"temp":72}"#);
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_on_one_link() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.link(
            0,
            1,
            vec![SubscriptionIntent::new("sensors").publish().subscribe()],
        )
        .await
        .unwrap();

        mesh.write(0, "sensors", json!("from a")).unwrap();
        assert!(settles_at(mesh.node(1), "sensors", 1, QUIET).await);
        assert_eq!(stored(mesh.node(0), "sensors"), 1);

        mesh.write(1, "sensors", json!("from b")).unwrap();
        assert!(settles_at(mesh.node(0), "sensors", 2, QUIET).await);
        assert_eq!(stored(mesh.node(1), "sensors"), 2);
    }

    #[tokio::test]
    async fn test_inert_intent_is_accepted() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.link(0, 1, vec![SubscriptionIntent::new("sensors")])
            .await
            .unwrap();

        mesh.write(1, "sensors", json!(1)).unwrap();
        tokio::time::sleep(QUIET).await;
        assert_eq!(stored(mesh.node(0), "sensors"), 0);
        assert_eq!(mesh.node(0).registry().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_client_is_refused() {
        init_test_logging();
        let mesh = Mesh::start(&["b"]).await.unwrap();
        let socket = raw_client(mesh.node(0)).await.unwrap();

        let refused = socket.subscribe(&"sensors".into()).await.unwrap_err();
        assert!(is_refused(&refused), "{refused}");

        socket.publish(&"sensors".into(), json!("sneaky")).unwrap();
        tokio::time::sleep(QUIET).await;
        assert_eq!(stored(mesh.node(0), "sensors"), 0);
        socket.close();
    }

    #[tokio::test]
    async fn test_bad_credentials_keep_client_unauthenticated() {
        init_test_logging();
        let mesh = Mesh::start(&["b"]).await.unwrap();
        let socket = raw_client(mesh.node(0)).await.unwrap();

        let reply = socket
            .invoke(
                skein_core::LOGIN_PROCEDURE,
                json!({"username": "mesh", "password": "nope"}),
                Some(SETTLE),
            )
            .await;
        assert!(matches!(reply, Err(SkeinError::RemoteError(_))));
        assert!(!socket.is_authenticated());
        socket.close();
    }

    #[tokio::test]
    async fn test_client_publish_is_stored_and_tagged_once() {
        init_test_logging();
        let mesh = Mesh::start(&["b"]).await.unwrap();
        let viewer = logged_in_client(mesh.node(0), Some("viewer")).await.unwrap();
        let mut stream = viewer.subscribe(&"sensors".into()).await.unwrap();

        let writer = logged_in_client(mesh.node(0), Some("writer")).await.unwrap();
        writer.publish(&"sensors".into(), json!({"temp": 72})).unwrap();

        let received = tokio::time::timeout(SETTLE, stream.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::from_value(received);
        assert_eq!(envelope.raw_data(), &json!({"temp": 72}));
        assert!(has_seen(&NodeName::from("b"), &envelope));
        assert_eq!(envelope.originator_count(), 1);

        assert!(settles_at(mesh.node(0), "sensors", 1, QUIET).await);
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_read_covers_every_peer() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b", "c"]).await.unwrap();
        let (a, b, c) = (mesh.node(0), mesh.node(1), mesh.node(2));
        a.write(&"sensors".into(), json!("a1")).unwrap();
        b.write(&"sensors".into(), json!("b1")).unwrap();
        c.write(&"sensors".into(), json!("c1")).unwrap();
        c.write(&"sensors".into(), json!("c2")).unwrap();

        // a reaches b as an inbound socket, c as an outbound link
        mesh.link(0, 1, Vec::new()).await.unwrap();
        mesh.link(1, 2, Vec::new()).await.unwrap();
        let refusing = StubPeer::start("refuser", StubBehavior::Refuse).await.unwrap();
        let silent = StubPeer::start("silent", StubBehavior::Hang).await.unwrap();
        b.connect_to_peer(refusing.key(), Vec::new()).await.unwrap();
        b.connect_to_peer(silent.key(), Vec::new()).await.unwrap();
        let stranger = raw_client(b).await.unwrap();
        assert!(eventually(SETTLE, || b.clients().len() == 2).await);

        let entries = b.read_all(&"sensors".into()).await;

        // 2 inbound + 3 outbound + b itself
        assert_eq!(entries.len(), 6);
        assert_eq!(entries.last().and_then(|e| e.server()), Some(&NodeName::from("b")));
        assert_eq!(
            servers(&entries),
            names(&["a", "b", "c"])
        );
        assert_eq!(entries.iter().filter(|e| e.is_empty()).count(), 3);
        let from_c = entries
            .iter()
            .find(|e| e.server() == Some(&NodeName::from("c")))
            .unwrap();
        assert_eq!(from_c.records().len(), 2);

        stranger.close();
        refusing.shutdown();
        silent.shutdown();
    }

    #[tokio::test]
    async fn test_fan_out_read_reports_failures_when_explicit() {
        init_test_logging();
        let mut config = node_config("b");
        config.aggregate.explicit_failures = true;
        let b = spawn_node_with(config).await.unwrap();
        b.write(&"sensors".into(), json!("b1")).unwrap();

        let serving = StubPeer::start("server", StubBehavior::Serve(vec![json!(1), json!(2)]))
            .await
            .unwrap();
        let refusing = StubPeer::start("refuser", StubBehavior::Refuse).await.unwrap();
        let silent = StubPeer::start("silent", StubBehavior::Hang).await.unwrap();
        for stub in [&serving, &refusing, &silent] {
            b.connect_to_peer(stub.key(), Vec::new()).await.unwrap();
        }
        let stranger = raw_client(&b).await.unwrap();
        assert!(eventually(SETTLE, || b.clients().len() == 1).await);

        let entries = b.read_all(&"sensors".into()).await;

        assert_eq!(entries.len(), 5);
        let failed: Vec<_> = entries
            .iter()
            .filter_map(|e| match e {
                FederatedEntry::Failed { peer, error } => Some((peer.clone(), error.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|(_, error)| !error.is_empty()));
        // an unauthenticated socket is skipped, not a failure
        assert_eq!(entries.iter().filter(|e| e.is_empty()).count(), 1);
        assert_eq!(servers(&entries), names(&["b", "server"]));

        stranger.close();
        for stub in [&serving, &refusing, &silent] {
            stub.shutdown();
        }
        b.shutdown();
    }

    #[tokio::test]
    async fn test_closed_peer_leaves_fan_out() {
        init_test_logging();
        let mesh = Mesh::start(&["a", "b"]).await.unwrap();
        mesh.link(0, 1, Vec::new()).await.unwrap();
        assert_eq!(mesh.node(0).read_all(&"sensors".into()).await.len(), 2);

        mesh.node(1).shutdown();
        assert!(eventually(SETTLE, || mesh.node(0).registry().is_empty()).await);

        let entries = mesh.node(0).read_all(&"sensors".into()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server(), Some(&NodeName::from("a")));
    }
}
