//! End-to-end cluster tests.
//!
//! These assemble real multi-node clusters in-process: every engine shares
//! one channel transport and one pair of catalog and cluster-state files,
//! and the test pumps envelopes between the engines by hand. Cross-node
//! scatter, reduction, buffering, and timeouts all run deterministically,
//! without sockets or wall clocks. One final test runs the whole TCP stack
//! instead: a real server on an ephemeral port, driven through the client.

#![warn(clippy::all)]

use std::time::{Duration, SystemTime};

use crossbeam::channel::Receiver;
use serde_json::{json, Value as Json};

use shardcast::cluster::{ChannelTransport, TcpTransport};
use shardcast::dispatch::TICKS_PER_SECOND;
use shardcast::message::{Address, Envelope};
use shardcast::plugin::Registry;
use shardcast::server::Options;
use shardcast::{Client, Engine, Server};

/// One dataset with a single partition, replicated on both nodes.
const REPLICATED: &str = r#"{
    "version": 2,
    "datasets": {
        "blog": {
            "numPartitions": 1,
            "ring": {
                "p0": {"weight": 1, "partitions": {
                    "2024-01-01": ["node0:10031/engine.000", "node1:10031/engine.000"]
                }}
            }
        }
    }
}"#;

/// One dataset with two partitions, split across the nodes.
const SPLIT: &str = r#"{
    "version": 2,
    "datasets": {
        "blog": {
            "numPartitions": 2,
            "ring": {
                "p0": {"weight": 1, "partitions": {"2024-01-01": ["node0:10031/engine.000"]}},
                "p1": {"weight": 1, "partitions": {"2024-01-01": ["node1:10031/engine.000"]}}
            }
        }
    }
}"#;

const ALL_LIVE: &str = r#"{
    "node0:10031/engine": {"role": "service-provider", "live": true},
    "node1:10031/engine": {"role": "service-provider", "live": true}
}"#;

const NODE1_DEAD: &str = r#"{
    "node0:10031/engine": {"role": "service-provider", "live": true},
    "node1:10031/engine": {"role": "service-provider", "live": false}
}"#;

const NODE0_DEAD: &str = r#"{
    "node0:10031/engine": {"role": "service-provider", "live": false},
    "node1:10031/engine": {"role": "service-provider", "live": true}
}"#;

struct TestNode {
    short: String,
    engine: Engine,
    inbox: Receiver<Envelope>,
}

/// An in-process cluster of engines over a shared channel transport.
struct TestCluster {
    dir: tempfile::TempDir,
    nodes: Vec<TestNode>,
    client: Receiver<Envelope>,
    /// Rewrites of the cluster-state file, for distinct mtimes.
    rewrites: u64,
}

impl TestCluster {
    /// Spins up one engine per node name against shared catalog and
    /// cluster-state files. Each engine keeps its own forward buffer, and
    /// the test's client channel is registered as a reply destination.
    fn new(names: &[&str], catalog: &str, cluster_state: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("catalog.json"), catalog).unwrap();
        std::fs::write(dir.path().join("cluster.json"), cluster_state).unwrap();

        let transport = ChannelTransport::new();
        let (client_tx, client) = crossbeam::channel::unbounded();
        transport.register(&Address::parse("client:9/reply").unwrap(), client_tx);

        let mut nodes = Vec::new();
        for short in names {
            let name = Address::parse(&format!("{short}:10031/engine")).unwrap();
            let (tx, inbox) = crossbeam::channel::unbounded();
            transport.register(&name, tx);
            let engine = Engine::new(Options {
                name,
                catalog_path: dir.path().join("catalog.json"),
                cluster_path: dir.path().join("cluster.json"),
                buffer_dir: dir.path().join(format!("buffer-{short}")),
                registry: Registry::builtin(),
                transport: Box::new(transport.clone()),
                timeout_seconds: 1,
                poll_seconds: 1,
            })
            .unwrap();
            nodes.push(TestNode { short: short.to_string(), engine, inbox });
        }
        Self { dir, nodes, client, rewrites: 0 }
    }

    fn node(&mut self, short: &str) -> &mut TestNode {
        self.nodes.iter_mut().find(|node| node.short == short).expect("unknown node")
    }

    /// Sends a client request into the given node and pumps the cluster.
    fn request(&mut self, node: &str, kind: &str, body: Json) {
        let mut envelope = Envelope::request(kind, "blog", body);
        envelope.reply_to = Some(Address::parse("client:9/reply").unwrap());
        self.node(node).engine.process(envelope);
        self.pump();
    }

    /// The next client reply. Panics if there is none, since the pump has
    /// already delivered everything in flight.
    fn reply(&mut self) -> Envelope {
        self.client.try_recv().expect("no reply")
    }

    /// Delivers queued envelopes between the engines until traffic stops.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for node in &mut self.nodes {
                while let Ok(envelope) = node.inbox.try_recv() {
                    node.engine.process(envelope);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Advances every engine one tick, then pumps.
    fn tick(&mut self) {
        for node in &mut self.nodes {
            node.engine.tick();
        }
        self.pump();
    }

    /// Rewrites the shared cluster-state file. The watchers compare mtimes,
    /// which can be coarse, so every rewrite is stamped with a distinct
    /// timestamp in the past.
    fn set_cluster_state(&mut self, contents: &str) {
        let path = self.dir.path().join("cluster.json");
        std::fs::write(&path, contents).unwrap();
        self.rewrites += 1;
        let stamp = SystemTime::now() - Duration::from_secs(60) + Duration::from_secs(self.rewrites);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
    }
}

#[test]
fn writes_replicate_and_reads_serve_from_either_node() {
    let mut cluster = TestCluster::new(&["node0", "node1"], REPLICATED, ALL_LIVE);

    // The write fans out to both replicas; the reply is the and-reduction
    // of their results, so a 200 means both nodes stored the record.
    cluster.request("node0", "add", json!({"key": "user1", "record": ["user1", "hello world"]}));
    let reply = cluster.reply();
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body, json!({"result": true}));

    // Whichever replica the broadcast picks, and whichever node plans, the
    // record is there.
    for node in ["node0", "node1"] {
        cluster.request(node, "search", json!({"query": "hello"}));
        let reply = cluster.reply();
        assert_eq!(reply.status_code, Some(200));
        assert_eq!(reply.body["result"]["count"], json!(1));
    }
}

#[test]
fn searches_reduce_partial_results_across_nodes() {
    let mut cluster = TestCluster::new(&["node0", "node1"], SPLIT, ALL_LIVE);

    // Keys spread over the ring, so the shards end up on different nodes.
    for key in ["a", "b", "c", "d", "e"] {
        cluster.request("node0", "add", json!({"key": key, "record": [key, "payload"]}));
        assert_eq!(cluster.reply().status_code, Some(200));
    }

    // Planned on the other node: its reduce step gathers this node's
    // partials over the wire.
    cluster.request("node1", "search", json!({}));
    let reply = cluster.reply();
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body["result"]["count"], json!(5));
    assert_eq!(reply.body["result"]["records"].as_array().unwrap().len(), 5);

    cluster.request("node0", "count", json!({}));
    assert_eq!(cluster.reply().body, json!({"result": 5}));
}

#[test]
fn a_failing_shard_surfaces_its_error() {
    let mut cluster = TestCluster::new(&["node0", "node1"], REPLICATED, ALL_LIVE);

    // Both replicas reject the record; exactly one error becomes the reply.
    cluster.request("node0", "add", json!({"key": "user1"}));
    let reply = cluster.reply();
    assert_eq!(reply.status_code, Some(400));
    assert_eq!(reply.body, json!("bad request: missing record"));
}

#[test]
fn dead_node_buffers_writes_and_replays_them_on_revival() {
    let mut cluster = TestCluster::new(&["node0", "node1"], REPLICATED, NODE1_DEAD);

    // Dead nodes stay write targets, so the plan covers both replicas and
    // node1's dispatch is spooled. The session can't gather node1's part,
    // so no reply comes.
    cluster.request("node0", "add", json!({"key": "user1", "record": ["user1", "hello world"]}));
    assert!(cluster.client.try_recv().is_err());
    assert_eq!(cluster.node("node0").engine.sessions(), 1);

    // Reads keep working meanwhile, served by the live replica.
    cluster.request("node0", "search", json!({"query": "hello"}));
    assert_eq!(cluster.reply().body["result"]["count"], json!(1));

    // The write session expires silently.
    for _ in 0..=TICKS_PER_SECOND {
        cluster.tick();
    }
    assert_eq!(cluster.node("node0").engine.sessions(), 0);
    assert!(cluster.client.try_recv().is_err(), "timeouts never answer the client");

    // node1 revives: the next poll replays the spooled dispatch, and its
    // replica executes the write after the fact.
    cluster.set_cluster_state(ALL_LIVE);
    for _ in 0..=TICKS_PER_SECOND {
        cluster.tick();
    }

    // With node0 out of the picture, reads can only come from node1's
    // replica, proving the replay landed.
    cluster.set_cluster_state(NODE0_DEAD);
    for _ in 0..=TICKS_PER_SECOND {
        cluster.tick();
    }
    cluster.request("node1", "search", json!({"query": "hello"}));
    let reply = cluster.reply();
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body["result"]["count"], json!(1));
}

#[test]
fn status_reflects_cluster_health() {
    let mut cluster = TestCluster::new(&["node0", "node1"], SPLIT, NODE1_DEAD);

    cluster.request("node0", "status", json!({}));
    let reply = cluster.reply();
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body["name"], "node0:10031/engine");
    assert_eq!(reply.body["sessions"], 0);
    assert_eq!(reply.body["nodes"]["node0:10031/engine"]["live"], true);
    assert_eq!(reply.body["nodes"]["node1:10031/engine"]["live"], false);
    assert_eq!(reply.body["nodes"]["node1:10031/engine"]["writable"], true);
    assert_eq!(reply.body["nodes"]["node1:10031/engine"]["readable"], false);
}

#[test]
fn tcp_server_round_trip() {
    // A real single-node server on an ephemeral port. The port has to go
    // into the catalog and node name, so bind before writing them.
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let name = format!("127.0.0.1:{port}/engine");

    std::fs::write(
        dir.path().join("catalog.json"),
        format!(
            r#"{{
                "version": 2,
                "datasets": {{
                    "blog": {{
                        "numPartitions": 1,
                        "ring": {{
                            "p0": {{"weight": 1, "partitions": {{"2024-01-01": ["{name}.000"]}}}}
                        }}
                    }}
                }}
            }}"#
        ),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("cluster.json"),
        format!(r#"{{"{name}": {{"role": "service-provider", "live": true}}}}"#),
    )
    .unwrap();

    let engine = Engine::new(Options {
        name: Address::parse(&name).unwrap(),
        catalog_path: dir.path().join("catalog.json"),
        cluster_path: dir.path().join("cluster.json"),
        buffer_dir: dir.path().join("buffer"),
        registry: Registry::builtin(),
        transport: Box::new(TcpTransport::new()),
        timeout_seconds: 5,
        poll_seconds: 1,
    })
    .unwrap();

    let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
    let server = std::thread::spawn(move || Server::new(engine).serve(listener, shutdown_rx));

    let client = Client::new(Address::parse(&name).unwrap());
    let reply = client.request("add", "blog", json!({"key": "k", "record": ["k", 7]})).unwrap();
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body, json!({"result": true}));

    let reply = client.request("search", "blog", json!({"query": "7"})).unwrap();
    assert_eq!(reply.body["result"]["count"], json!(1));

    let status = client.status().unwrap();
    assert_eq!(status["name"], name);

    shutdown_tx.send(true).unwrap();
    server.join().unwrap().unwrap();
}
