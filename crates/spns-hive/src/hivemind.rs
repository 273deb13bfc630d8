//! The engine: global state, RPC handlers, and network diffing.
//!
//! One coarse mutex guards the engine's shared tables; each
//! [`SNode`] carries its own leaf lock, and a third small mutex guards the
//! startup deferral queue. Lock ordering is `deferred < core < snode`: a
//! thread holding the core lock may take an SNode lock (`add_account` and
//! friends are leaves), but subscription rechecks snapshot the tables and
//! release the core lock before driving `check_subs`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use spns_crypto::blake2b::Blake2b32 as Blake2b32Hasher;
use spns_db::{queries, Pool};
use spns_transport::bencode::Value;
use spns_transport::link::{Incoming, Link, LinkAddr, Responder, Router, Transport};
use spns_transport::TransportError;
use spns_types::bytes::decode_sized;
use spns_types::{
    AccountId, Blake2b32, Ed25519Pk, EncKey, Signature, SubaccountTag, SubkeyTag, SwarmPubkey,
    X25519Pk, INVALID_SWARM_ID,
};

use crate::signature::{verify_storage_signature, Auth, Subaccount};
use crate::snode::SNode;
use crate::subscription::{unsubscribe_message, Subscription};
use crate::{
    unix_timestamp, HiveConfig, HiveError, Result, MSG_DATA_MAX_SIZE, MSG_HASH_MAX_SIZE,
    MSG_HASH_MIN_SIZE, SERVICE_DATA_MAX_SIZE, SERVICE_ID_MAX_SIZE, SERVICE_ID_MIN_SIZE,
    SERVICE_NAME_MAX_SIZE, SIGNATURE_EXPIRY, UNSUBSCRIBE_GRACE,
};

/// Field selection for `rpc.get_service_nodes`.
const GET_SNS_PARAMS: &str = r#"{
  "active_only": true,
  "fields": {
    "pubkey_x25519": true,
    "public_ip": true,
    "storage_lmq_port": true,
    "swarm_id": true,
    "block_hash": true,
    "height": true
  }
}"#;

/// The RPC surface, as dispatched through [`HiveMind::dispatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcEndpoint {
    Subscribe,
    Unsubscribe,
    RegisterService,
    ServiceStats,
    GetStats,
    NotifyBlock,
    NotifyMessage,
}

impl RpcEndpoint {
    pub fn name(&self) -> &'static str {
        match self {
            RpcEndpoint::Subscribe => "push.subscribe",
            RpcEndpoint::Unsubscribe => "push.unsubscribe",
            RpcEndpoint::RegisterService => "admin.register_service",
            RpcEndpoint::ServiceStats => "admin.service_stats",
            RpcEndpoint::GetStats => "admin.get_stats",
            RpcEndpoint::NotifyBlock => "notify.block",
            RpcEndpoint::NotifyMessage => "notify.message",
        }
    }

    /// Whether a failure should produce a JSON error reply.
    fn is_json_request(&self) -> bool {
        matches!(self, RpcEndpoint::Subscribe | RpcEndpoint::Unsubscribe)
    }
}

pub(crate) struct HiveState {
    /// Every known storage node, by its X25519 identity.
    pub sns_by_pubkey: HashMap<X25519Pk, Arc<SNode>>,
    /// Swarm id → the nodes serving that swarm. Every node here is also in
    /// `sns_by_pubkey`.
    pub swarms: HashMap<u64, Vec<Arc<SNode>>>,
    /// Sorted list of all current swarm ids.
    pub swarm_ids: Vec<u64>,
    /// Master subscription table: account → deduplicated subscriptions.
    pub subscribers: HashMap<SwarmPubkey, Vec<Subscription>>,
    /// Registered notifier services.
    pub services: HashMap<String, Arc<dyn Link>>,
    /// Two-generation notification dedup filter.
    pub filter: HashSet<Blake2b32>,
    pub filter_rotate: HashSet<Blake2b32>,
    pub filter_rotate_at: Instant,
    /// Hash and height of the last processed block.
    pub last_block: (String, i64),
}

struct DeferredQueue {
    ready: bool,
    queue: VecDeque<(RpcEndpoint, Incoming)>,
}

/// The engine.
pub struct HiveMind {
    pub config: HiveConfig,
    pub(crate) pool: Arc<Pool>,
    /// `[0]` is the main transport; the rest are dedicated push instances
    /// handed to new SNodes round-robin.
    transports: Vec<Arc<dyn Transport>>,
    push_rr: AtomicUsize,
    local_node: Mutex<Option<Arc<dyn Link>>>,
    pub(crate) state: Mutex<HiveState>,
    deferred: Mutex<DeferredQueue>,
    ready: AtomicBool,
    have_new_subs: AtomicBool,
    pub(crate) pending_connects: AtomicI64,
    connect_count: AtomicI64,
    pub(crate) startup_instant: Instant,
    pub(crate) startup_unix: i64,
    pub(crate) last_stats_logged: Mutex<Option<Instant>>,
}

struct SubUnsubArgs {
    pubkey: SwarmPubkey,
    auth: Auth,
    sig_ts: i64,
    sig: Signature,
    service: String,
    service_info: serde_json::Value,
}

enum ValidationAction {
    Subscribe { sub: Subscription, enc_key: EncKey },
    Unsubscribe { auth: Auth, sig: Signature, sig_ts: i64 },
}

struct Validation {
    service: String,
    service_info: serde_json::Value,
    conn: Arc<dyn Link>,
    pubkey: SwarmPubkey,
    action: ValidationAction,
}

struct MessageNotification {
    account: AccountId,
    hash: Vec<u8>,
    namespace: i16,
    timestamp_ms: i64,
    expiry_ms: i64,
    data: Option<Vec<u8>>,
}

impl HiveMind {
    pub fn new(
        config: HiveConfig,
        pool: Arc<Pool>,
        transport: Arc<dyn Transport>,
        push_transports: Vec<Arc<dyn Transport>>,
    ) -> Arc<Self> {
        let filter_rotate_at = Instant::now() + config.filter_lifetime;
        let mut transports = vec![transport];
        transports.extend(push_transports);

        Arc::new(Self {
            config,
            pool,
            transports,
            push_rr: AtomicUsize::new(0),
            local_node: Mutex::new(None),
            state: Mutex::new(HiveState {
                sns_by_pubkey: HashMap::new(),
                swarms: HashMap::new(),
                swarm_ids: Vec::new(),
                subscribers: HashMap::new(),
                services: HashMap::new(),
                filter: HashSet::new(),
                filter_rotate: HashSet::new(),
                filter_rotate_at,
                last_block: (String::new(), -1),
            }),
            deferred: Mutex::new(DeferredQueue {
                ready: false,
                queue: VecDeque::new(),
            }),
            ready: AtomicBool::new(false),
            have_new_subs: AtomicBool::new(false),
            pending_connects: AtomicI64::new(0),
            connect_count: AtomicI64::new(0),
            startup_instant: Instant::now(),
            startup_unix: unix_timestamp(),
            last_stats_logged: Mutex::new(None),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, HiveState> {
        self.state.lock().expect("core lock")
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Run the startup sequence: clean and load the database, connect and
    /// ping the local block node (fatal on failure), wait for notifier
    /// registrations, flip ready (draining deferred requests), and kick
    /// off the first SN-list fetch.
    ///
    /// Periodic timers are installed separately via
    /// [`install_timers`](Self::install_timers).
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.db_cleanup()?;
        self.load_saved_subscriptions()?;

        tracing::info!(addr = %self.config.local_node, "connecting to local node");
        let local = self.transports[0]
            .connect(&self.config.local_node)
            .await
            .map_err(|e| HiveError::Internal(format!("local node connection failed: {e}")))?;
        local
            .request("ping.ping", vec![])
            .await
            .map_err(|e| HiveError::Internal(format!("local node failed to respond to ping: {e}")))?;
        tracing::info!("connected to local node");
        *self.local_node.lock().expect("local node lock") = Some(local);

        self.wait_for_notifiers().await;
        self.set_ready().await;
        self.refresh_sns();
        tracing::info!("startup complete");
        Ok(())
    }

    async fn wait_for_notifiers(&self) {
        if self.config.notifier_wait.is_zero() {
            return;
        }
        tracing::info!(
            "waiting for notifiers to register (max {:?})",
            self.config.notifier_wait
        );
        let deadline = Instant::now() + self.config.notifier_wait;
        loop {
            let missing: Vec<&String> = {
                let state = self.lock_state();
                self.config
                    .notifiers_expected
                    .iter()
                    .filter(|name| !state.services.contains_key(*name))
                    .collect()
            };
            if !self.config.notifiers_expected.is_empty() && missing.is_empty() {
                tracing::info!("all configured notifiers have registered");
                break;
            }
            if Instant::now() > deadline {
                if !missing.is_empty() {
                    tracing::warn!(
                        "notifier startup timeout reached; did not receive registrations for: {}",
                        missing
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let registered = self.lock_state().services.len();
        tracing::info!("done waiting for notifiers; {registered} registered");
    }

    /// Flip the ready flag and drain requests captured during startup, in
    /// arrival order. Taking the deferred lock around the flip guarantees
    /// nothing slips between the flip and the drain.
    async fn set_ready(self: &Arc<Self>) {
        let drained: Vec<(RpcEndpoint, Incoming)> = {
            let mut deferred = self.deferred.lock().expect("deferred lock");
            deferred.ready = true;
            self.ready.store(true, Ordering::Release);
            deferred.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::info!("processing {} request(s) deferred during startup", drained.len());
        }
        for (endpoint, msg) in drained {
            self.dispatch(endpoint, msg).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn ready_or_defer(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(HiveError::StartupDeferred)
        }
    }

    /// Install the periodic work: database cleanup (30 s), the slow
    /// subscription recheck (`subs_interval`), the stats log line (15 s),
    /// and the fast new-subscription recheck (100 ms).
    pub fn install_timers(self: &Arc<Self>) {
        self.spawn_interval(Duration::from_secs(30), |hive| {
            if let Err(e) = hive.db_cleanup() {
                tracing::warn!("db cleanup failed: {e}");
            }
        });
        self.spawn_interval(self.config.subs_interval, |hive| hive.subs_slow());
        self.spawn_interval(Duration::from_secs(15), |hive| hive.log_stats());
        self.spawn_interval(Duration::from_millis(100), |hive| hive.subs_fast());
    }

    fn spawn_interval(self: &Arc<Self>, period: Duration, tick: fn(&Arc<HiveMind>)) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick(&this);
            }
        });
    }

    /// Register every RPC endpoint on `router`. `notify_queue` bounds the
    /// `notify.message` backlog; excess notifications are dropped, which
    /// the at-most-once delivery contract permits.
    pub fn register_endpoints(self: &Arc<Self>, router: &Router, notify_queue: usize) {
        use RpcEndpoint::*;
        for endpoint in [
            Subscribe,
            Unsubscribe,
            RegisterService,
            ServiceStats,
            GetStats,
            NotifyBlock,
        ] {
            let this = Arc::clone(self);
            router.register(endpoint.name(), move |incoming| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.dispatch(endpoint, incoming).await })
            });
        }
        let this = Arc::clone(self);
        router.register_bounded(NotifyMessage.name(), notify_queue, move |incoming| {
            let this = Arc::clone(&this);
            Box::pin(async move { this.dispatch(NotifyMessage, incoming).await })
        });
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one RPC. Requests arriving before startup completes are
    /// captured and replayed when ready flips; any error a handler did not
    /// already answer produces a JSON error reply (for the JSON request
    /// endpoints) and a log line.
    pub async fn dispatch(self: &Arc<Self>, endpoint: RpcEndpoint, mut msg: Incoming) {
        loop {
            match self.invoke(endpoint, &mut msg).await {
                Ok(()) => return,
                Err(HiveError::StartupDeferred) => {
                    let mut deferred = self.deferred.lock().expect("deferred lock");
                    if !deferred.ready {
                        deferred.queue.push_back((endpoint, msg));
                        return;
                    }
                    // Ready flipped between the handler's check and now;
                    // run it for real.
                    drop(deferred);
                }
                Err(err) => {
                    tracing::error!("error in {} handler: {err}", endpoint.name());
                    if endpoint.is_json_request() {
                        if let Some(responder) = msg.responder.take() {
                            responder.reply_json(&err.to_reply());
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn invoke(self: &Arc<Self>, endpoint: RpcEndpoint, msg: &mut Incoming) -> Result<()> {
        match endpoint {
            RpcEndpoint::Subscribe => self.on_subscribe(msg),
            RpcEndpoint::Unsubscribe => self.on_unsubscribe(msg),
            RpcEndpoint::RegisterService => self.on_reg_service(msg),
            RpcEndpoint::ServiceStats => self.on_service_stats(msg),
            RpcEndpoint::GetStats => self.on_get_stats(msg),
            RpcEndpoint::NotifyBlock => {
                self.refresh_sns();
                Ok(())
            }
            RpcEndpoint::NotifyMessage => self.on_message_notification(msg),
        }
    }

    // ------------------------------------------------------------------
    // Subscribe / unsubscribe
    // ------------------------------------------------------------------

    fn on_subscribe(self: &Arc<Self>, msg: &mut Incoming) -> Result<()> {
        self.ready_or_defer()?;
        let responder = msg
            .responder
            .take()
            .ok_or_else(|| HiveError::Internal("subscribe arrived without reply path".into()))?;

        match self.prepare_subscribe(&msg.parts) {
            Ok(validation) => self.spawn_validation(validation, responder),
            Err(err) => {
                tracing::debug!("subscription failed: {err}");
                responder.reply_json(&err.to_reply());
            }
        }
        Ok(())
    }

    fn on_unsubscribe(self: &Arc<Self>, msg: &mut Incoming) -> Result<()> {
        self.ready_or_defer()?;
        let responder = msg
            .responder
            .take()
            .ok_or_else(|| HiveError::Internal("unsubscribe arrived without reply path".into()))?;

        match self.prepare_unsubscribe(&msg.parts) {
            Ok(validation) => self.spawn_validation(validation, responder),
            Err(err) => {
                tracing::debug!("unsubscription failed: {err}");
                responder.reply_json(&err.to_reply());
            }
        }
        Ok(())
    }

    fn prepare_subscribe(&self, parts: &[Vec<u8>]) -> Result<Validation> {
        let args = parse_json_body(parts)?;
        let common = self.sub_unsub_args(&args)?;

        let enc_key = EncKey::parse_str(req_str(&args, "enc_key")?)?;
        let namespaces = parse_namespaces(&args)?;
        let want_data = args
            .get("data")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| HiveError::BadInput("missing required parameter data".into()))?;

        let conn = self.service_conn(&common.service)?;

        // Verifies the MONITOR signature.
        let sub = Subscription::new(
            &common.pubkey,
            common.auth,
            namespaces,
            want_data,
            common.sig_ts,
            common.sig,
        )?;

        Ok(Validation {
            service: common.service,
            service_info: common.service_info,
            conn,
            pubkey: common.pubkey,
            action: ValidationAction::Subscribe { sub, enc_key },
        })
    }

    fn prepare_unsubscribe(&self, parts: &[Vec<u8>]) -> Result<Validation> {
        let args = parse_json_body(parts)?;
        let common = self.sub_unsub_args(&args)?;
        let conn = self.service_conn(&common.service)?;

        Ok(Validation {
            service: common.service,
            service_info: common.service_info,
            conn,
            pubkey: common.pubkey,
            action: ValidationAction::Unsubscribe {
                auth: common.auth,
                sig: common.sig,
                sig_ts: common.sig_ts,
            },
        })
    }

    fn sub_unsub_args(&self, args: &serde_json::Value) -> Result<SubUnsubArgs> {
        let account = AccountId::parse_str(req_str(args, "pubkey")?)?;
        let session_ed = if account.prefix() == 0x05 {
            Some(Ed25519Pk::parse_str(req_str(args, "session_ed25519")?)?)
        } else {
            None
        };
        let pubkey = SwarmPubkey::new(account, session_ed)?;

        let auth = if let Some(combined) = args.get("subaccount").and_then(|v| v.as_str()) {
            let blob = decode_sized(combined.as_bytes(), SubaccountTag::SIZE + Signature::SIZE)?;
            Auth::Subaccount(Subaccount {
                tag: SubaccountTag::try_from(&blob[..SubaccountTag::SIZE])?,
                sig: Signature::try_from(&blob[SubaccountTag::SIZE..])?,
            })
        } else if let Some(tag) = args.get("subkey_tag").and_then(|v| v.as_str()) {
            Auth::Subkey(SubkeyTag::parse_str(tag)?)
        } else {
            Auth::Account
        };

        let sig = Signature::parse_str(req_str(args, "signature")?)?;
        let sig_ts = args
            .get("sig_ts")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| HiveError::BadInput("missing required parameter sig_ts".into()))?;

        let service = req_str(args, "service")?.to_owned();
        if service.is_empty() || service.len() > SERVICE_NAME_MAX_SIZE {
            return Err(HiveError::BadInput("invalid service name".into()));
        }
        let service_info = args
            .get("service_info")
            .cloned()
            .ok_or_else(|| HiveError::BadInput("missing required parameter service_info".into()))?;

        Ok(SubUnsubArgs {
            pubkey,
            auth,
            sig_ts,
            sig,
            service,
            service_info,
        })
    }

    fn service_conn(&self, service: &str) -> Result<Arc<dyn Link>> {
        self.lock_state()
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| HiveError::ServiceNotAvailable(service.to_owned()))
    }

    /// Ask the service's notifier to validate the device registration; the
    /// reply (or failure) resolves the client's pending request.
    fn spawn_validation(self: &Arc<Self>, validation: Validation, responder: Responder) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = validation
                .conn
                .request(
                    "notifier.validate",
                    vec![
                        validation.service.clone().into_bytes(),
                        validation.service_info.to_string().into_bytes(),
                    ],
                )
                .await;
            this.on_notifier_validation(outcome, validation, responder);
        });
    }

    fn on_notifier_validation(
        &self,
        outcome: std::result::Result<Vec<Vec<u8>>, TransportError>,
        validation: Validation,
        responder: Responder,
    ) {
        let service = validation.service.clone();
        tracing::trace!(%service, ok = outcome.is_ok(), "received notifier validation");

        let mut extras: Vec<(&'static str, bool)> = Vec::new();
        let reply = match self.handle_validation(outcome, validation, &mut extras) {
            Ok(message) => {
                let mut obj = serde_json::json!({ "success": true, "message": message });
                for (key, value) in extras {
                    obj[key] = serde_json::Value::Bool(value);
                }
                obj
            }
            Err(err) => {
                if matches!(err, HiveError::Internal(_)) {
                    tracing::warn!(%service, "sub/unsub handling failed: {err}");
                } else {
                    tracing::debug!(%service, "replying with error {}: {err}", err.code());
                }
                err.to_reply()
            }
        };
        responder.reply_json(&reply);
    }

    fn handle_validation(
        &self,
        outcome: std::result::Result<Vec<Vec<u8>>, TransportError>,
        validation: Validation,
        extras: &mut Vec<(&'static str, bool)>,
    ) -> Result<String> {
        let parts = match outcome {
            Ok(parts) => parts,
            Err(TransportError::Timeout) => {
                return Err(HiveError::ServiceTimeout(validation.service));
            }
            Err(err) => {
                tracing::error!(service = %validation.service, "notifier communication failed: {err}");
                return Err(HiveError::Error(format!(
                    "failed to communicate with {} notification service",
                    validation.service
                )));
            }
        };

        if parts.len() < 2 || parts.len() > 3 {
            return Err(HiveError::Error(format!(
                "invalid {}-part response from notification service",
                parts.len()
            )));
        }

        let code: i64 = std::str::from_utf8(&parts[0])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                HiveError::Error("notification service did not give a status code".into())
            })?;
        if code != 0 {
            return Err(HiveError::Refusal {
                code,
                message: String::from_utf8_lossy(&parts[1]).into_owned(),
            });
        }

        let service_id = String::from_utf8(parts[1].clone())
            .map_err(|_| HiveError::Error("service id is not valid utf-8".into()))?;
        if service_id.len() < SERVICE_ID_MIN_SIZE {
            return Err(HiveError::Error(format!(
                "service id too short ({})",
                service_id.len()
            )));
        }
        if service_id.len() > SERVICE_ID_MAX_SIZE {
            return Err(HiveError::Error(format!(
                "service id too long ({})",
                service_id.len()
            )));
        }

        match validation.action {
            ValidationAction::Subscribe { sub, enc_key } => {
                let service_data = parts.get(2).cloned();
                if let Some(data) = &service_data {
                    if data.len() > SERVICE_DATA_MAX_SIZE {
                        return Err(HiveError::Error(format!(
                            "service data too long ({})",
                            data.len()
                        )));
                    }
                }
                tracing::trace!(
                    service = %validation.service,
                    account = %validation.pubkey.id,
                    "adding subscription"
                );
                let new_sub = self.add_subscription(
                    validation.pubkey,
                    &validation.service,
                    &service_id,
                    service_data,
                    enc_key,
                    sub,
                )?;
                if new_sub {
                    self.have_new_subs.store(true, Ordering::Release);
                }
                extras.push((if new_sub { "added" } else { "updated" }, true));
                Ok(if new_sub {
                    "Subscription successful".into()
                } else {
                    "Resubscription successful".into()
                })
            }
            ValidationAction::Unsubscribe { auth, sig, sig_ts } => {
                let removed = self.remove_subscription(
                    &validation.pubkey,
                    &auth,
                    &validation.service,
                    &service_id,
                    &sig,
                    sig_ts,
                )?;
                extras.push(("removed", removed));
                Ok(if removed {
                    "Device unsubscribed from push notifications".into()
                } else {
                    "Device was not subscribed to push notifications".into()
                })
            }
        }
    }

    /// Add or renew a subscription. Returns true when the subscription is
    /// brand new (rather than a renewal of an equivalent one).
    pub fn add_subscription(
        &self,
        pubkey: SwarmPubkey,
        service: &str,
        service_id: &str,
        service_data: Option<Vec<u8>>,
        enc_key: EncKey,
        sub: Subscription,
    ) -> Result<bool> {
        let subaccount = sub.auth.subaccount();
        let write = queries::subscriptions::SubscriptionWrite {
            account: &pubkey.id,
            session_ed25519: pubkey.session_ed.then_some(&pubkey.ed25519),
            subkey_tag: sub.auth.subkey_tag(),
            subaccount_tag: subaccount.map(|s| &s.tag),
            subaccount_sig: subaccount.map(|s| &s.sig),
            signature: &sub.sig,
            signature_ts: sub.sig_ts,
            want_data: sub.want_data,
            enc_key: &enc_key,
            service,
            svcid: service_id,
            svcdata: service_data.as_deref(),
        };

        let mut conn = self.pool.get()?;
        let tx = conn.transaction().map_err(spns_db::DbError::from)?;

        let existing = queries::subscriptions::find(&tx, &pubkey.id, service, service_id)?;
        let new_sub = existing.is_none();
        let (id, replace_ns) = match existing {
            Some(row) => {
                tracing::trace!(account = %pubkey.id, "updating subscription");
                queries::subscriptions::update(&tx, row.id, &write)?;
                let differs = row.namespaces != sub.namespaces;
                if differs {
                    queries::subscriptions::clear_namespaces(&tx, row.id)?;
                }
                (row.id, differs)
            }
            None => {
                tracing::trace!(account = %pubkey.id, "inserting new subscription");
                (queries::subscriptions::insert(&tx, &write)?, true)
            }
        };
        if replace_ns {
            queries::subscriptions::insert_namespaces(&tx, id, &sub.namespaces)?;
        }

        let stat = if new_sub { "subscription" } else { "sub_renew" };
        for svc in ["", service] {
            queries::stats::increment(&tx, svc, stat, 1)?;
        }
        tx.commit().map_err(spns_db::DbError::from)?;

        let mut state = self.lock_state();
        pubkey.update_swarm(&state.swarm_ids);

        let subs = state.subscribers.entry(pubkey.clone()).or_default();
        let mut renewed_existing = false;
        for existing in subs.iter_mut() {
            if existing.is_same(&sub) {
                if sub.is_newer(existing) {
                    existing.sig = sub.sig;
                    existing.sig_ts = sub.sig_ts;
                }
                renewed_existing = true;
                break;
            }
        }
        if !renewed_existing {
            subs.push(sub);
        }

        // A brand new subscription goes out to the whole swarm immediately
        // so monitoring starts without waiting for the next renewal pass.
        if new_sub {
            if let Some(snodes) = state.swarms.get(&pubkey.swarm()) {
                for snode in snodes {
                    snode.add_account(&pubkey, true);
                }
            }
        }

        Ok(new_sub)
    }

    /// Remove a subscription row. In-memory subscriber state is left
    /// alone: other devices may share the account, and device filtering
    /// happens in the notification DB lookup anyway.
    pub fn remove_subscription(
        &self,
        pubkey: &SwarmPubkey,
        auth: &Auth,
        service: &str,
        service_id: &str,
        sig: &Signature,
        sig_ts: i64,
    ) -> Result<bool> {
        let now = unix_timestamp();
        let grace = UNSUBSCRIBE_GRACE.as_secs() as i64;
        if sig_ts < now - grace || sig_ts > now + grace {
            return Err(HiveError::BadInput(
                "invalid signature: sig_ts is too far from current time".into(),
            ));
        }

        let msg = unsubscribe_message(pubkey, sig_ts);
        verify_storage_signature(msg.as_bytes(), sig, pubkey, auth)?;

        let conn = self.pool.get()?;
        Ok(queries::subscriptions::delete(&conn, &pubkey.id, service, service_id)?)
    }

    // ------------------------------------------------------------------
    // Service registration
    // ------------------------------------------------------------------

    fn on_reg_service(&self, msg: &mut Incoming) -> Result<()> {
        if msg.parts.len() != 1 {
            tracing::error!("{}-part data, expected 1", msg.parts.len());
            return Ok(());
        }
        let Ok(service) = String::from_utf8(msg.parts[0].clone()) else {
            tracing::error!("service registration used a non-utf8 service name");
            return Ok(());
        };
        if service.is_empty() {
            tracing::error!("service registration used illegal empty service name");
            return Ok(());
        }
        if service.len() > SERVICE_NAME_MAX_SIZE {
            tracing::error!("service name too long ({})", service.len());
            return Ok(());
        }

        let link = Arc::clone(&msg.link);
        enum Outcome {
            Added,
            Replaced,
            Confirmed,
        }
        let outcome = {
            let mut state = self.lock_state();
            match state.services.entry(service.clone()) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(link);
                    Outcome::Added
                }
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    if Arc::ptr_eq(entry.get(), &link) {
                        Outcome::Confirmed
                    } else {
                        entry.insert(link);
                        Outcome::Replaced
                    }
                }
            }
        };
        match outcome {
            Outcome::Added => tracing::info!("'{service}' notification service registered"),
            Outcome::Replaced => {
                tracing::info!("'{service}' notification service reconnected/reregistered")
            }
            Outcome::Confirmed => {
                tracing::trace!("'{service}' notification service confirmed (already registered)")
            }
        }

        if let Some(responder) = msg.responder.take() {
            responder.reply(vec![]);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message notifications
    // ------------------------------------------------------------------

    fn on_message_notification(&self, msg: &mut Incoming) -> Result<()> {
        if msg.parts.len() != 1 {
            tracing::warn!(
                "unexpected message notification: {}-part data, expected 1-part",
                msg.parts.len()
            );
            return Ok(());
        }
        let note = match parse_notification(&msg.parts[0]) {
            Ok(note) => note,
            Err(why) => {
                tracing::warn!("unexpected notification: {why}");
                return Ok(());
            }
        };
        tracing::trace!(
            account = %note.account,
            hash = %String::from_utf8_lossy(&note.hash),
            ns = note.namespace,
            ts = note.timestamp_ms,
            exp = note.expiry_ms,
            data = note.data.as_ref().map_or(0, Vec::len),
            "got a notification"
        );

        let conn = self.pool.get()?;
        let targets = queries::subscriptions::matching_notification(&conn, &note.account, note.namespace)?;
        if targets.is_empty() {
            tracing::debug!("no active subscriptions match, ignoring notification");
            return Ok(());
        }

        let fingerprints: Vec<Blake2b32> = targets
            .iter()
            .map(|t| {
                let mut h = Blake2b32Hasher::new();
                h.update(&t.service).update(&t.svcid).update(&note.hash);
                Blake2b32(h.finalize())
            })
            .collect();

        let mut notify_count = 0i64;
        {
            let mut state = self.lock_state();

            let now = Instant::now();
            if now >= state.filter_rotate_at {
                state.filter_rotate = std::mem::take(&mut state.filter);
                state.filter_rotate_at = now + self.config.filter_lifetime;
            }

            for (target, fingerprint) in targets.iter().zip(&fingerprints) {
                if state.filter_rotate.contains(fingerprint) || !state.filter.insert(*fingerprint)
                {
                    tracing::debug!("ignoring duplicate notification");
                    continue;
                }
                let Some(link) = state.services.get(&target.service) else {
                    tracing::warn!(
                        service = %target.service,
                        "notification depends on unregistered service, ignoring"
                    );
                    continue;
                };
                tracing::debug!(service = %target.service, "sending push via notifier");
                link.send("notifier.push", vec![build_push_payload(&note, target)]);
                notify_count += 1;
            }
        }

        queries::stats::increment(&conn, "", "notifications", notify_count)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // SN list management
    // ------------------------------------------------------------------

    /// Ask the local node for the current service node list and diff it
    /// into our connection state when it arrives.
    pub fn refresh_sns(self: &Arc<Self>) {
        let local = self.local_node.lock().expect("local node lock").clone();
        let Some(local) = local else {
            tracing::warn!("cannot refresh SN list: no local node connection");
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match local
                .request("rpc.get_service_nodes", vec![GET_SNS_PARAMS.as_bytes().to_vec()])
                .await
            {
                Ok(parts) => this.apply_sn_list(&parts),
                Err(err) => tracing::warn!("get_service_nodes request failed: {err}"),
            }
        });
    }

    /// Apply a `rpc.get_service_nodes` reply: spawn/drop/re-address SNodes,
    /// rebucket swarms, and re-distribute subscribers.
    pub fn apply_sn_list(self: &Arc<Self>, parts: &[Vec<u8>]) {
        if let Err(err) = self.apply_sn_list_inner(parts) {
            tracing::warn!("failed to process SN update: {err}");
        }
    }

    fn apply_sn_list_inner(self: &Arc<Self>, parts: &[Vec<u8>]) -> Result<()> {
        if parts.len() != 2 {
            return Err(HiveError::Error(format!(
                "rpc.get_service_nodes returned unexpected {}-length response",
                parts.len()
            )));
        }
        if parts[0] != b"200" {
            return Err(HiveError::Error(format!(
                "rpc.get_service_nodes returned unexpected response {}: {}",
                String::from_utf8_lossy(&parts[0]),
                String::from_utf8_lossy(&parts[1]),
            )));
        }
        let res: serde_json::Value = serde_json::from_slice(&parts[1])
            .map_err(|e| HiveError::Error(format!("failed to parse get_service_nodes response: {e}")))?;

        let states = res
            .get("service_node_states")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| HiveError::Error("service_node_states looks wrong".into()))?;
        let new_hash = res
            .get("block_hash")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| HiveError::Error("missing block_hash".into()))?
            .to_owned();
        let new_height = res
            .get("height")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| HiveError::Error("missing height".into()))?;

        struct SnEntry {
            ip: String,
            port: u16,
            swarm: u64,
        }
        let mut sns: HashMap<X25519Pk, SnEntry> = HashMap::with_capacity(states.len());
        for sn in states {
            let pkx = sn.get("pubkey_x25519").and_then(serde_json::Value::as_str);
            let ip = sn.get("public_ip").and_then(serde_json::Value::as_str);
            let port = sn
                .get("storage_lmq_port")
                .and_then(serde_json::Value::as_u64)
                .and_then(|p| u16::try_from(p).ok());
            let swarm = sn.get("swarm_id").and_then(serde_json::Value::as_u64);

            if let (Some(pkx), Some(ip), Some(port), Some(swarm)) = (pkx, ip, port, swarm) {
                if pkx.len() == 64
                    && !ip.is_empty()
                    && ip != "0.0.0.0"
                    && port > 0
                    && swarm != INVALID_SWARM_ID
                {
                    if let Ok(pk) = X25519Pk::parse_str(pkx) {
                        sns.insert(
                            pk,
                            SnEntry {
                                ip: ip.to_owned(),
                                port,
                                swarm,
                            },
                        );
                    }
                }
            }
        }
        tracing::debug!(
            "{} active SNs ({} missing details)",
            sns.len(),
            states.len() - sns.len()
        );

        let mut recheck = false;
        {
            let mut state = self.lock_state();

            if new_hash == state.last_block.0 {
                tracing::debug!("block unchanged, nothing to do");
                return Ok(());
            }
            tracing::debug!("new block {new_hash} @ {new_height}");

            let new_ids: Vec<u64> = states
                .iter()
                .filter_map(|sn| sn.get("swarm_id").and_then(serde_json::Value::as_u64))
                .filter(|&id| id != INVALID_SWARM_ID)
                .collect::<BTreeSet<u64>>()
                .into_iter()
                .collect();
            let swarms_changed = new_ids != state.swarm_ids;
            if swarms_changed {
                state.swarm_ids = new_ids;
            }
            state.last_block = (new_hash, new_height);

            // Anything known but absent from the new list has left the
            // network (or lost required details): disconnect and drop.
            let mut dropped = 0;
            let stale: Vec<X25519Pk> = state
                .sns_by_pubkey
                .keys()
                .filter(|pk| !sns.contains_key(*pk))
                .copied()
                .collect();
            for pk in stale {
                if let Some(snode) = state.sns_by_pubkey.remove(&pk) {
                    tracing::debug!(%pk, "disconnecting departed SN");
                    if let Some(bucket) = state.swarms.get_mut(&snode.swarm()) {
                        bucket.retain(|sn| !Arc::ptr_eq(sn, &snode));
                    }
                    snode.disconnect();
                    dropped += 1;
                }
            }

            let mut new_or_changed: Vec<Arc<SNode>> = Vec::new();
            for (pk, entry) in &sns {
                let addr = LinkAddr::new(entry.ip.clone(), entry.port);
                if let Some(snode) = state.sns_by_pubkey.get(pk).cloned() {
                    // Known node: maybe moved swarm, maybe changed address.
                    if snode.swarm() != entry.swarm {
                        if let Some(bucket) = state.swarms.get_mut(&snode.swarm()) {
                            bucket.retain(|sn| !Arc::ptr_eq(sn, &snode));
                        }
                        snode.reset_swarm(entry.swarm);
                        state
                            .swarms
                            .entry(entry.swarm)
                            .or_default()
                            .push(Arc::clone(&snode));
                        new_or_changed.push(Arc::clone(&snode));
                    }
                    // Reconnects only if the address actually changed.
                    snode.connect_to(addr);
                } else {
                    let snode = SNode::new(
                        Arc::downgrade(self),
                        self.next_push_transport(),
                        addr,
                        entry.swarm,
                    );
                    state.sns_by_pubkey.insert(*pk, Arc::clone(&snode));
                    state
                        .swarms
                        .entry(entry.swarm)
                        .or_default()
                        .push(Arc::clone(&snode));
                    new_or_changed.push(Arc::clone(&snode));
                    snode.connect();
                }
            }

            state.swarms.retain(|_, bucket| !bucket.is_empty());
            tracing::debug!(
                "{} new/updated SNs; dropped {} old SNs",
                new_or_changed.len(),
                dropped
            );

            if swarms_changed {
                // Full membership recheck: recompute every subscriber's
                // swarm, eject movers from their old nodes, and (re-)add
                // every subscriber to its swarm's nodes.
                let mut moved = 0;
                for pk in state.subscribers.keys() {
                    if pk.update_swarm(&state.swarm_ids) {
                        moved += 1;
                    }
                }
                tracing::debug!("{moved} accounts changed swarms");

                let HiveState {
                    swarms,
                    swarm_ids,
                    subscribers,
                    ..
                } = &mut *state;
                for (swarm_id, bucket) in swarms.iter() {
                    for snode in bucket {
                        snode.remove_stale_swarm_members(swarm_ids);
                    }
                    for pk in subscribers.keys() {
                        if pk.swarm() == *swarm_id {
                            for snode in bucket {
                                snode.add_account(pk, false);
                            }
                        }
                    }
                }
                recheck = true;
            } else if !new_or_changed.is_empty() {
                // Same swarms, but nodes moved in or out of them: make sure
                // the new/moved nodes carry every subscriber they should.
                for pk in state.subscribers.keys() {
                    for snode in &new_or_changed {
                        if snode.swarm() == pk.swarm() {
                            snode.add_account(pk, false);
                        }
                    }
                }
                recheck = true;
            }
        }

        if recheck {
            self.check_subs(false);
        }
        Ok(())
    }

    fn next_push_transport(&self) -> Arc<dyn Transport> {
        if self.transports.len() == 1 {
            return Arc::clone(&self.transports[0]);
        }
        let idx = 1 + self.push_rr.fetch_add(1, Ordering::Relaxed) % (self.transports.len() - 1);
        Arc::clone(&self.transports[idx])
    }

    // ------------------------------------------------------------------
    // Subscription rechecks
    // ------------------------------------------------------------------

    /// Drive `check_subs` on every SNode against a snapshot of the master
    /// table. The core lock is released before touching any SNode.
    pub fn check_subs(&self, fast: bool) {
        let (snodes, subs) = {
            let state = self.lock_state();
            (
                state.sns_by_pubkey.values().cloned().collect::<Vec<_>>(),
                state.subscribers.clone(),
            )
        };
        for snode in snodes {
            snode.check_subs(&subs, false, fast);
        }
    }

    /// Recheck a single node (typically right after it connects).
    pub fn check_my_subs(&self, snode: &Arc<SNode>, initial: bool) {
        let subs = self.lock_state().subscribers.clone();
        snode.check_subs(&subs, initial, false);
    }

    /// Slow periodic pass: renew the block subscription with the local
    /// node, then recheck everything.
    pub fn subs_slow(self: &Arc<Self>) {
        if let Some(local) = self.local_node.lock().expect("local node lock").clone() {
            local.send("sub.block", vec![]);
        }
        self.check_subs(false);
    }

    /// Fast periodic pass: only runs when a brand-new subscription was
    /// flagged, and only processes force-queued entries.
    pub fn subs_fast(self: &Arc<Self>) {
        if self.have_new_subs.swap(false, Ordering::AcqRel) {
            self.check_subs(true);
        }
    }

    // ------------------------------------------------------------------
    // Connection gating
    // ------------------------------------------------------------------

    /// Reserve a connection slot. A caller getting `true` must call
    /// [`finished_connect`](Self::finished_connect) when the attempt
    /// resolves, successfully or not.
    pub fn allow_connect(&self) -> bool {
        let pending = self.pending_connects.fetch_add(1, Ordering::AcqRel) + 1;
        if pending > self.config.max_pending_connects {
            self.pending_connects.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let total = self.connect_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(pending, total, "establishing connection");
        true
    }

    pub fn finished_connect(&self) {
        // If we were saturated, freed capacity means gated nodes can now
        // connect; a full recheck kicks them.
        let try_more =
            self.pending_connects.load(Ordering::Acquire) >= self.config.max_pending_connects;
        self.pending_connects.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!("finished connection; {}triggering more", if try_more { "" } else { "not " });
        if try_more {
            self.check_subs(false);
        }
    }

    // ------------------------------------------------------------------
    // Database maintenance and loading
    // ------------------------------------------------------------------

    /// Delete subscriptions whose signatures have passed the expiry
    /// window.
    pub fn db_cleanup(&self) -> Result<()> {
        let conn = self.pool.get()?;
        let cutoff = unix_timestamp() - SIGNATURE_EXPIRY.as_secs() as i64;
        let removed = queries::subscriptions::delete_expired(&conn, cutoff)?;
        if removed > 0 {
            tracing::debug!("db cleanup removed {removed} expired subscription(s)");
        }
        Ok(())
    }

    /// Stream saved subscriptions into the in-memory table, deduplicating
    /// equivalent rows (keeping the newest signature). Runs before any
    /// worker threads exist.
    pub fn load_saved_subscriptions(&self) -> Result<()> {
        use spns_db::DbError;

        let started = Instant::now();
        let mut last_print = started;

        let conn = self.pool.get()?;
        let total = queries::subscriptions::count(&conn)?;
        tracing::info!("loading {total} stored subscriptions from database");

        let mut state = self.lock_state();
        let mut count = 0i64;
        let mut unique = 0i64;
        queries::subscriptions::for_each(&conn, |row| {
            let auth = match (row.subaccount_tag, row.subaccount_sig, row.subkey_tag) {
                (Some(tag), Some(sig), _) => Auth::Subaccount(Subaccount { tag, sig }),
                (_, _, Some(tag)) => Auth::Subkey(tag),
                _ => Auth::Account,
            };
            let pubkey = SwarmPubkey::new_unchecked(row.account, row.session_ed25519)
                .map_err(|e| DbError::CorruptRow(e.to_string()))?;

            let subs = state.subscribers.entry(pubkey).or_default();
            let mut dupe = false;
            for existing in subs.iter_mut() {
                if existing.is_same_parts(&auth, &row.namespaces, row.want_data) {
                    if row.signature_ts > existing.sig_ts {
                        existing.sig_ts = row.signature_ts;
                        existing.sig = row.signature;
                    }
                    dupe = true;
                    break;
                }
            }
            if !dupe {
                unique += 1;
                subs.push(
                    Subscription::load(
                        auth,
                        row.namespaces,
                        row.want_data,
                        row.signature_ts,
                        row.signature,
                    )
                    .map_err(|e| DbError::CorruptRow(e.to_string()))?,
                );
            }

            count += 1;
            if count % 100_000 == 0 && last_print.elapsed() >= Duration::from_secs(1) {
                tracing::info!("... processed {count}/{total} subscriptions");
                last_print = Instant::now();
            }
            Ok(())
        })?;

        tracing::info!(
            "done loading saved subscriptions; {unique} unique subscriptions to {} accounts",
            state.subscribers.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of accounts with at least one in-memory subscription.
    pub fn subscriber_account_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }

    /// The SNode for a given storage node identity, if known.
    pub fn snode(&self, pk: &X25519Pk) -> Option<Arc<SNode>> {
        self.lock_state().sns_by_pubkey.get(pk).cloned()
    }

    pub fn snode_count(&self) -> usize {
        self.lock_state().sns_by_pubkey.len()
    }
}

fn parse_json_body(parts: &[Vec<u8>]) -> Result<serde_json::Value> {
    let body = parts
        .first()
        .ok_or_else(|| HiveError::BadInput("missing request body".into()))?;
    serde_json::from_slice(body).map_err(|_| HiveError::BadInput("Invalid JSON".into()))
}

fn req_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| HiveError::BadInput(format!("missing required parameter {key}")))
}

fn parse_namespaces(args: &serde_json::Value) -> Result<Vec<i16>> {
    let list = args
        .get("namespaces")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| HiveError::BadInput("missing required parameter namespaces".into()))?;
    list.iter()
        .map(|v| {
            v.as_i64()
                .and_then(|ns| i16::try_from(ns).ok())
                .ok_or_else(|| HiveError::BadInput("invalid namespace value".into()))
        })
        .collect()
}

fn parse_notification(data: &[u8]) -> std::result::Result<MessageNotification, String> {
    let value = Value::decode(data).map_err(|e| format!("undecodable data ({e})"))?;
    let dict = value.as_dict().ok_or("not a dict")?;

    let field = |key: &[u8]| dict.get(key);

    let account_raw = field(b"@")
        .and_then(Value::as_bytes)
        .ok_or("missing account (@)")?;
    let account = AccountId::try_from(account_raw).map_err(|_| "wrong account size (@)")?;

    let hash = field(b"h")
        .and_then(Value::as_bytes)
        .ok_or("missing msg hash (h)")?;
    if hash.len() < MSG_HASH_MIN_SIZE || hash.len() > MSG_HASH_MAX_SIZE {
        return Err("msg hash size out of range (h)".into());
    }

    let namespace = field(b"n")
        .and_then(Value::as_int)
        .and_then(|n| i16::try_from(n).ok())
        .ok_or("missing namespace (n)")?;

    let timestamp_ms = field(b"t")
        .and_then(Value::as_int)
        .ok_or("missing message timestamp (t)")?;
    let expiry_ms = field(b"z")
        .and_then(Value::as_int)
        .ok_or("missing message expiry (z)")?;

    let data = match field(b"~") {
        Some(v) => Some(v.as_bytes().ok_or("bad message data (~)")?.to_vec()),
        None => None,
    };

    Ok(MessageNotification {
        account,
        hash: hash.to_vec(),
        namespace,
        timestamp_ms,
        expiry_ms,
        data,
    })
}

/// The bencoded `notifier.push` payload, ASCII-sorted keys.
fn build_push_payload(
    note: &MessageNotification,
    target: &queries::subscriptions::NotifyTarget,
) -> Vec<u8> {
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"".to_vec(), Value::from(target.service.as_str()));
    if let Some(svcdata) = &target.svcdata {
        dict.insert(b"!".to_vec(), Value::from(svcdata.clone()));
    }
    dict.insert(b"#".to_vec(), Value::from(note.hash.clone()));
    dict.insert(b"&".to_vec(), Value::from(target.svcid.as_str()));
    dict.insert(b"@".to_vec(), Value::from(&note.account.0[..]));
    dict.insert(b"^".to_vec(), Value::from(&target.enc_key.0[..]));
    dict.insert(b"n".to_vec(), Value::Int(note.namespace as i64));
    if target.want_data {
        if let Some(body) = &note.data {
            if body.len() <= MSG_DATA_MAX_SIZE {
                dict.insert(b"~".to_vec(), Value::from(body.clone()));
            }
        }
    }
    Value::Dict(dict).encode()
}
