//! End-to-end engine tests over the in-process transport.
//!
//! These wire a HiveMind to fake storage nodes, a fake notifier, and a
//! fake local block node, then drive the real RPC surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;
use spns_db::Pool;
use spns_hive::subscription::{monitor_message, unsubscribe_message};
use spns_hive::{HiveConfig, HiveMind, RpcEndpoint};
use spns_transport::bencode::Value;
use spns_transport::frame::{Frame, Parts};
use spns_transport::link::{Incoming, LinkAddr, Responder, Router};
use spns_transport::mem::{mem_pair, MemNetwork};
use spns_types::{AccountId, Ed25519Pk, SwarmPubkey, X25519Pk};

const LOCAL_NODE: (&str, u16) = ("127.0.0.1", 22025);

struct TestEnv {
    network: Arc<MemNetwork>,
    hive: Arc<HiveMind>,
    pool: Arc<Pool>,
    /// `notifier.validate` calls seen by the fake notifier.
    validations: Arc<Mutex<Vec<Parts>>>,
    /// `notifier.push` payloads seen by the fake notifier.
    pushes: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Reply the fake notifier gives to validate requests.
    validate_reply: Arc<Mutex<Parts>>,
    /// `monitor.messages` bodies per SN port.
    monitors: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    notifier_router: Arc<Router>,
    hive_router: Arc<Router>,
}

fn svcid() -> String {
    "device-id-".repeat(4) // 40 chars, within [32, 999]
}

impl TestEnv {
    fn new() -> Self {
        let network = MemNetwork::new();

        // Fake local block node: answers pings and serves an empty SN list
        // until a test installs a real one via apply_sn_list.
        let local_router = Router::new();
        local_router.register("ping.ping", |incoming| {
            Box::pin(async move {
                if let Some(responder) = incoming.responder {
                    responder.reply(vec![b"pong".to_vec()]);
                }
            })
        });
        local_router.register("rpc.get_service_nodes", |incoming| {
            Box::pin(async move {
                if let Some(responder) = incoming.responder {
                    let body = json!({
                        "block_hash": "",
                        "height": -1,
                        "service_node_states": [],
                    });
                    responder.reply(vec![b"200".to_vec(), body.to_string().into_bytes()]);
                }
            })
        });
        local_router.register("sub.block", |_incoming| Box::pin(async {}));
        network.listen(LinkAddr::new(LOCAL_NODE.0, LOCAL_NODE.1), local_router);

        // Fake notifier.
        let validations = Arc::new(Mutex::new(Vec::new()));
        let pushes = Arc::new(Mutex::new(Vec::new()));
        let validate_reply = Arc::new(Mutex::new(vec![b"0".to_vec(), svcid().into_bytes()]));

        let notifier_router = Router::new();
        {
            let validations = Arc::clone(&validations);
            let validate_reply = Arc::clone(&validate_reply);
            notifier_router.register("notifier.validate", move |incoming| {
                let validations = Arc::clone(&validations);
                let validate_reply = Arc::clone(&validate_reply);
                Box::pin(async move {
                    validations.lock().unwrap().push(incoming.parts.clone());
                    if let Some(responder) = incoming.responder {
                        responder.reply(validate_reply.lock().unwrap().clone());
                    }
                })
            });
        }
        {
            let pushes = Arc::clone(&pushes);
            notifier_router.register("notifier.push", move |incoming| {
                let pushes = Arc::clone(&pushes);
                Box::pin(async move {
                    if let Some(part) = incoming.parts.first() {
                        pushes.lock().unwrap().push(part.clone());
                    }
                })
            });
        }

        let hive_router = Router::new();
        let pool = Pool::open_in_memory().expect("pool");
        let config = HiveConfig {
            local_node: LinkAddr::new(LOCAL_NODE.0, LOCAL_NODE.1),
            notifier_wait: Duration::ZERO,
            ..HiveConfig::default()
        };
        let hive = HiveMind::new(
            config,
            Arc::clone(&pool),
            network.transport(Arc::clone(&hive_router)),
            vec![],
        );
        hive.register_endpoints(&hive_router, 4000);

        Self {
            network,
            hive,
            pool,
            validations,
            pushes,
            validate_reply,
            monitors: Arc::new(Mutex::new(Vec::new())),
            notifier_router,
            hive_router,
        }
    }

    async fn start(&self) {
        self.hive.startup().await.expect("startup");
    }

    /// Register the fake notifier as the "apns" service.
    async fn register_notifier(&self) {
        let (to_notifier, _from_notifier) =
            mem_pair(Arc::clone(&self.hive_router), Arc::clone(&self.notifier_router));
        self.hive
            .dispatch(
                RpcEndpoint::RegisterService,
                Incoming {
                    endpoint: "admin.register_service".into(),
                    parts: vec![b"apns".to_vec()],
                    link: to_notifier,
                    responder: None,
                },
            )
            .await;
    }

    /// Register a fake SN at `port` and return its router hookup.
    fn listen_sn(&self, port: u16) {
        let monitors = Arc::clone(&self.monitors);
        let sn_router = Router::new();
        sn_router.register("monitor.messages", move |incoming| {
            let monitors = Arc::clone(&monitors);
            Box::pin(async move {
                if let Some(body) = incoming.parts.first() {
                    monitors.lock().unwrap().push((port, body.clone()));
                }
                if let Some(responder) = incoming.responder {
                    responder.reply(vec![b"ok".to_vec()]);
                }
            })
        });
        self.network
            .listen(LinkAddr::new("10.0.0.1", port), sn_router);
    }

    /// Push an SN list into the engine.
    fn apply_sns(&self, entries: &[(X25519Pk, u16, u64)], hash: &str, height: i64) {
        let states: Vec<serde_json::Value> = entries
            .iter()
            .map(|(pk, port, swarm)| {
                json!({
                    "pubkey_x25519": pk.hex(),
                    "public_ip": "10.0.0.1",
                    "storage_lmq_port": port,
                    "swarm_id": swarm,
                })
            })
            .collect();
        let body = json!({
            "block_hash": hash,
            "height": height,
            "service_node_states": states,
        });
        self.hive
            .apply_sn_list(&[b"200".to_vec(), body.to_string().into_bytes()]);
    }

    /// Run an RPC request through dispatch and return the parsed JSON
    /// reply.
    async fn rpc(&self, endpoint: RpcEndpoint, body: serde_json::Value) -> serde_json::Value {
        let (responder, rx) = Responder::channel();
        let (link, _peer) = mem_pair(Arc::clone(&self.hive_router), Router::new());
        self.hive
            .dispatch(
                endpoint,
                Incoming {
                    endpoint: endpoint.name().into(),
                    parts: vec![body.to_string().into_bytes()],
                    link,
                    responder: Some(responder),
                },
            )
            .await;
        match rx.await.expect("reply") {
            Frame::Reply { parts } => serde_json::from_slice(&parts[0]).expect("json reply"),
            Frame::Error { message } => panic!("rpc error frame: {message}"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    async fn notify_message(&self, payload: Vec<u8>) {
        let (link, _peer) = mem_pair(Arc::clone(&self.hive_router), Router::new());
        self.hive
            .dispatch(
                RpcEndpoint::NotifyMessage,
                Incoming {
                    endpoint: "notify.message".into(),
                    parts: vec![payload],
                    link,
                    responder: None,
                },
            )
            .await;
    }

    fn stat(&self, service: &str, name: &str) -> Option<i64> {
        let conn = self.pool.get().expect("conn");
        conn.query_row(
            "SELECT val_int FROM service_stats WHERE service = ?1 AND name = ?2",
            rusqlite::params![service, name],
            |row| row.get(0),
        )
        .ok()
    }

    fn db_sub_count(&self) -> i64 {
        let conn = self.pool.get().expect("conn");
        conn.query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))
            .expect("count")
    }
}

/// A Session-style account: `0x05 || x25519(ed_pubkey)`.
fn session_account(seed: u8) -> (SigningKey, SwarmPubkey) {
    let sk = SigningKey::from_bytes(&[seed; 32]);
    let ed = Ed25519Pk(sk.verifying_key().to_bytes());
    let x = spns_crypto::ed25519::ed25519_to_x25519(ed.as_bytes()).unwrap();
    let mut id = [0u8; 33];
    id[0] = 0x05;
    id[1..].copy_from_slice(&x);
    let pk = SwarmPubkey::new(AccountId(id), Some(ed)).unwrap();
    (sk, pk)
}

fn subscribe_body(
    sk: &SigningKey,
    pk: &SwarmPubkey,
    namespaces: &[i16],
    want_data: bool,
    sig_ts: i64,
) -> serde_json::Value {
    let msg = monitor_message(pk, sig_ts, want_data, namespaces);
    let sig = sk.sign(msg.as_bytes());
    let mut body = json!({
        "pubkey": pk.id.hex(),
        "namespaces": namespaces,
        "data": want_data,
        "sig_ts": sig_ts,
        "signature": hex::encode(sig.to_bytes()),
        "service": "apns",
        "service_info": { "token": "device-token" },
        "enc_key": hex::encode([7u8; 32]),
    });
    if pk.session_ed {
        body["session_ed25519"] = json!(pk.ed25519.hex());
    }
    body
}

fn unsubscribe_body(sk: &SigningKey, pk: &SwarmPubkey, sig_ts: i64) -> serde_json::Value {
    let msg = unsubscribe_message(pk, sig_ts);
    let sig = sk.sign(msg.as_bytes());
    let mut body = json!({
        "pubkey": pk.id.hex(),
        "sig_ts": sig_ts,
        "signature": hex::encode(sig.to_bytes()),
        "service": "apns",
        "service_info": { "token": "device-token" },
    });
    if pk.session_ed {
        body["session_ed25519"] = json!(pk.ed25519.hex());
    }
    body
}

fn notification_payload(pk: &SwarmPubkey, hash: &[u8], namespace: i16) -> Vec<u8> {
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"@".to_vec(), Value::Bytes(pk.id.0.to_vec()));
    dict.insert(b"h".to_vec(), Value::Bytes(hash.to_vec()));
    dict.insert(b"n".to_vec(), Value::Int(namespace as i64));
    dict.insert(b"t".to_vec(), Value::Int(1_700_000_000_000));
    dict.insert(b"z".to_vec(), Value::Int(1_700_001_000_000));
    dict.insert(b"~".to_vec(), Value::Bytes(b"ciphertext".to_vec()));
    Value::Dict(dict).encode()
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Two swarm ids bracketing the account's swarm space so the nearest one
/// is unambiguous.
fn swarms_for(pk: &SwarmPubkey) -> (u64, u64) {
    let near = pk.swarm_space.wrapping_sub(5);
    let far = pk.swarm_space.wrapping_add(5000);
    (near, far)
}

#[tokio::test]
async fn fresh_subscribe_then_renewal() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(41);
    let (near, far) = swarms_for(&pk);
    env.listen_sn(7001);
    env.listen_sn(7002);
    let sn1 = X25519Pk([1; 32]);
    let sn2 = X25519Pk([2; 32]);
    env.apply_sns(&[(sn1, 7001, near), (sn2, 7002, far)], "block-1", 100);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ts = now();
    let reply = env
        .rpc(
            RpcEndpoint::Subscribe,
            subscribe_body(&sk, &pk, &[-400, 0, 1, 2, 17], true, ts),
        )
        .await;
    assert_eq!(reply["success"], json!(true));
    assert_eq!(reply["added"], json!(true));

    assert_eq!(env.db_sub_count(), 1);
    assert_eq!(env.hive.subscriber_account_count(), 1);
    assert_eq!(env.stat("", "subscription"), Some(1));
    assert_eq!(env.stat("apns", "subscription"), Some(1));

    // The swarm member holds the account at the head of its queue, due
    // immediately; the other swarm's node knows nothing about it.
    let near_node = env.hive.snode(&sn1).expect("snode");
    assert!(near_node.has_account(&pk));
    let queue = near_node.queue_snapshot();
    assert_eq!(queue.first().map(|(acc, due)| (acc.is_some(), *due)), Some((true, 0)));
    assert!(!env.hive.snode(&sn2).expect("snode").has_account(&pk));

    // Renewal with a newer signature: updated, not added; still one row.
    let reply = env
        .rpc(
            RpcEndpoint::Subscribe,
            subscribe_body(&sk, &pk, &[-400, 0, 1, 2, 17], true, ts + 60),
        )
        .await;
    assert_eq!(reply["success"], json!(true));
    assert_eq!(reply["updated"], json!(true));
    assert_eq!(env.db_sub_count(), 1);
    assert_eq!(env.hive.subscriber_account_count(), 1);
    assert_eq!(env.stat("", "sub_renew"), Some(1));

    // Both subscribes consulted the notifier.
    assert_eq!(env.validations.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn expired_signature_is_rejected() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(42);
    let ts = now() - 14 * 24 * 60 * 60 - 1;
    let reply = env
        .rpc(RpcEndpoint::Subscribe, subscribe_body(&sk, &pk, &[0], true, ts))
        .await;
    assert_eq!(reply["error"], json!(1));
    assert!(reply["message"].as_str().unwrap().contains("too old"));
    assert_eq!(env.db_sub_count(), 0);
    // The notifier is never consulted for invalid input.
    assert!(env.validations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn service_not_available() {
    let env = TestEnv::new();
    env.start().await;

    let (sk, pk) = session_account(43);
    let reply = env
        .rpc(RpcEndpoint::Subscribe, subscribe_body(&sk, &pk, &[0], true, now()))
        .await;
    assert_eq!(reply["error"], json!(2));
}

#[tokio::test]
async fn notifier_refusal_passes_through() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;
    *env.validate_reply.lock().unwrap() = vec![b"4".to_vec(), b"bad device token".to_vec()];

    let (sk, pk) = session_account(44);
    let reply = env
        .rpc(RpcEndpoint::Subscribe, subscribe_body(&sk, &pk, &[0], true, now()))
        .await;
    assert_eq!(reply["error"], json!(4));
    assert_eq!(reply["message"], json!("bad device token"));
    assert_eq!(env.db_sub_count(), 0);
}

#[tokio::test]
async fn notification_dedup_sends_one_push() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(45);
    let reply = env
        .rpc(
            RpcEndpoint::Subscribe,
            subscribe_body(&sk, &pk, &[0, 17], true, now()),
        )
        .await;
    assert_eq!(reply["success"], json!(true));

    // The same message delivered by two swarm members within the filter
    // window: exactly one push goes out.
    let hash = b"abcdefabcdefabcdefabcdefabcdefab";
    env.notify_message(notification_payload(&pk, hash, 17)).await;
    env.notify_message(notification_payload(&pk, hash, 17)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pushes = env.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(env.stat("", "notifications"), Some(1));

    // The payload carries the account, hash, enc key, namespace, and body.
    let parsed = Value::decode(&pushes[0]).expect("bencoded push");
    let dict = parsed.as_dict().expect("dict");
    assert_eq!(dict[&b"@".to_vec()], Value::Bytes(pk.id.0.to_vec()));
    assert_eq!(dict[&b"#".to_vec()], Value::Bytes(hash.to_vec()));
    assert_eq!(dict[&b"n".to_vec()], Value::Int(17));
    assert_eq!(dict[&b"~".to_vec()], Value::Bytes(b"ciphertext".to_vec()));
    assert_eq!(dict[&b"".to_vec()], Value::Bytes(b"apns".to_vec()));
}

#[tokio::test]
async fn notification_for_other_namespace_is_ignored() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(46);
    env.rpc(
        RpcEndpoint::Subscribe,
        subscribe_body(&sk, &pk, &[0, 17], true, now()),
    )
    .await;

    let hash = b"abcdefabcdefabcdefabcdefabcdefab";
    env.notify_message(notification_payload(&pk, hash, 3)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(env.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unsubscribe_removes_the_row() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(47);
    env.rpc(
        RpcEndpoint::Subscribe,
        subscribe_body(&sk, &pk, &[0], true, now()),
    )
    .await;
    assert_eq!(env.db_sub_count(), 1);

    let reply = env
        .rpc(RpcEndpoint::Unsubscribe, unsubscribe_body(&sk, &pk, now()))
        .await;
    assert_eq!(reply["success"], json!(true));
    assert_eq!(reply["removed"], json!(true));
    assert_eq!(env.db_sub_count(), 0);

    // In-memory subscribers stay: other devices may share the account.
    assert_eq!(env.hive.subscriber_account_count(), 1);

    // Unsubscribing again is a no-op.
    let reply = env
        .rpc(RpcEndpoint::Unsubscribe, unsubscribe_body(&sk, &pk, now()))
        .await;
    assert_eq!(reply["removed"], json!(false));
}

#[tokio::test]
async fn swarm_reshuffle_moves_accounts() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(48);
    let space = pk.swarm_space;

    // Initially the account's nearest swarm is `old`.
    let old = space.wrapping_sub(3);
    let other = space.wrapping_add(4000);
    env.listen_sn(7101);
    env.listen_sn(7102);
    let sn1 = X25519Pk([11; 32]);
    let sn2 = X25519Pk([12; 32]);
    env.apply_sns(&[(sn1, 7101, old), (sn2, 7102, other)], "block-1", 100);
    tokio::time::sleep(Duration::from_millis(50)).await;

    env.rpc(
        RpcEndpoint::Subscribe,
        subscribe_body(&sk, &pk, &[0], true, now()),
    )
    .await;
    let old_node = env.hive.snode(&sn1).expect("old node");
    assert!(old_node.has_account(&pk));

    // New block: a swarm appears dead-on the account's space, and the old
    // node moves to it while the other node keeps the old swarm id.
    let new = space;
    env.apply_sns(&[(sn1, 7101, other), (sn2, 7102, new)], "block-2", 101);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let moved_node = env.hive.snode(&sn2).expect("new node");
    assert!(moved_node.has_account(&pk), "account must follow its swarm");
    assert!(!old_node.has_account(&pk), "old swarm node must drop the account");
}

#[tokio::test]
async fn requests_before_ready_are_deferred_in_order() {
    let env = TestEnv::new();
    env.register_notifier().await;
    // No startup yet: the engine is not ready.

    let (sk1, pk1) = session_account(51);
    let (sk2, pk2) = session_account(52);

    let mut receivers = Vec::new();
    for (i, (sk, pk)) in [(&sk1, &pk1), (&sk2, &pk2)].into_iter().enumerate() {
        let mut body = subscribe_body(sk, pk, &[0], true, now());
        body["service_info"] = json!({ "token": format!("deferred-{i}") });
        let (responder, rx) = Responder::channel();
        let (link, _peer) = mem_pair(Arc::clone(&env.hive_router), Router::new());
        env.hive
            .dispatch(
                RpcEndpoint::Subscribe,
                Incoming {
                    endpoint: "push.subscribe".into(),
                    parts: vec![body.to_string().into_bytes()],
                    link,
                    responder: Some(responder),
                },
            )
            .await;
        receivers.push(rx);
    }

    // Neither request has been answered yet.
    for rx in receivers.iter_mut() {
        assert!(rx.try_recv().is_err());
    }
    assert!(!env.hive.is_ready());
    assert_eq!(env.db_sub_count(), 0);

    env.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Both deferred requests ran, each exactly once, in arrival order.
    for rx in receivers {
        let frame = rx.await.expect("deferred reply");
        match frame {
            Frame::Reply { parts } => {
                let reply: serde_json::Value = serde_json::from_slice(&parts[0]).unwrap();
                assert_eq!(reply["success"], json!(true), "reply: {reply}");
                assert_eq!(reply["added"], json!(true));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(env.db_sub_count(), 2);

    // Validations ran in arrival order.
    let validations = env.validations.lock().unwrap();
    assert_eq!(validations.len(), 2);
    for (i, parts) in validations.iter().enumerate() {
        let info = String::from_utf8_lossy(&parts[1]);
        assert!(info.contains(&format!("deferred-{i}")), "got {info}");
    }
}

#[tokio::test]
async fn connected_snode_batches_due_subscriptions() {
    let env = TestEnv::new();
    env.register_notifier().await;
    env.start().await;

    let (sk, pk) = session_account(53);
    let (near, _) = swarms_for(&pk);
    env.listen_sn(7201);
    let sn1 = X25519Pk([21; 32]);
    env.apply_sns(&[(sn1, 7201, near)], "block-1", 100);
    tokio::time::sleep(Duration::from_millis(50)).await;

    env.rpc(
        RpcEndpoint::Subscribe,
        subscribe_body(&sk, &pk, &[-400, 0, 17], true, now()),
    )
    .await;

    // The fast recheck picks up the force-queued account and sends one
    // monitor batch.
    env.hive.subs_fast();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let monitors = env.monitors.lock().unwrap();
    let batch = monitors
        .iter()
        .find(|(port, _)| *port == 7201)
        .map(|(_, body)| body.clone())
        .expect("monitor batch sent");

    let parsed = Value::decode(&batch).expect("bencoded list");
    let entries = parsed.as_list().expect("list");
    assert_eq!(entries.len(), 1);
    let dict = entries[0].as_dict().expect("dict");
    // Session account: P (master key) present, p absent.
    assert!(dict.contains_key(&b"P".to_vec()));
    assert!(!dict.contains_key(&b"p".to_vec()));
    assert_eq!(
        dict[&b"n".to_vec()],
        Value::List(vec![Value::Int(-400), Value::Int(0), Value::Int(17)])
    );
    assert_eq!(dict[&b"d".to_vec()], Value::Int(1));
    drop(monitors);

    // After the batch the queue is sorted by due time with the account
    // rescheduled into the jitter window.
    let queue = env.hive.snode(&sn1).expect("snode").queue_snapshot();
    assert!(!queue.is_empty());
    assert!(queue.windows(2).all(|w| w[0].1 <= w[1].1));
    let live: Vec<_> = queue.iter().filter(|(acc, _)| acc.is_some()).collect();
    assert_eq!(live.len(), 1);
    let due = live[0].1;
    let t = now();
    assert!(due >= t + 45 * 60 - 5 && due <= t + 55 * 60 + 5, "due {due} vs now {t}");
}
