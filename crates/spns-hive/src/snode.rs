//! Per-storage-node connection management.
//!
//! Each `SNode` owns one connection to a remote storage node plus the set
//! of accounts whose swarm it belongs to and a due-time queue driving
//! `monitor.messages` batches. Queue entries are lazily deleted: removal
//! just clears the account slot, and the drain loop skips the husk.
//!
//! Lock discipline: the internal mutex is a leaf. Nothing here calls back
//! into [`HiveMind`](crate::hivemind::HiveMind) while holding it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use rand::Rng;
use spns_transport::bencode::Value;
use spns_transport::link::{Link, LinkAddr, Transport};
use spns_types::SwarmPubkey;

use crate::hivemind::HiveMind;
use crate::signature::Auth;
use crate::subscription::Subscription;
use crate::{
    unix_timestamp, CONNECT_COOLDOWN, RESUBSCRIBE_MAX, RESUBSCRIBE_MIN, SUBS_REQUEST_LIMIT,
};

/// Connection and subscription state for one storage node.
pub struct SNode {
    hivemind: Weak<HiveMind>,
    transport: Arc<dyn Transport>,
    swarm: AtomicU64,
    connected: AtomicBool,
    inner: Mutex<Inner>,
}

struct Inner {
    addr: LinkAddr,
    link: Option<Arc<dyn Link>>,
    /// A connection attempt is in flight.
    connecting: bool,
    /// Bumped whenever the connection slot is (re)claimed, so a stale
    /// attempt completing late can tell it has been replaced.
    conn_gen: u64,
    subs: HashSet<SwarmPubkey>,
    /// `(account, due)` sorted ascending by due time; `None` accounts are
    /// lazily-deleted entries. Due time 0 (the epoch) marks entries that
    /// must go out in the very next batch.
    queue: VecDeque<(Option<SwarmPubkey>, i64)>,
    cooldown_until: Option<Instant>,
    cooldown_fails: usize,
}

impl SNode {
    pub fn new(
        hivemind: Weak<HiveMind>,
        transport: Arc<dyn Transport>,
        addr: LinkAddr,
        swarm: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            hivemind,
            transport,
            swarm: AtomicU64::new(swarm),
            connected: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                addr,
                link: None,
                connecting: false,
                conn_gen: 0,
                subs: HashSet::new(),
                queue: VecDeque::new(),
                cooldown_until: None,
                cooldown_fails: 0,
            }),
        })
    }

    /// The swarm this node currently serves.
    pub fn swarm(&self) -> u64 {
        self.swarm.load(Ordering::Relaxed)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Begin connecting to the current address, unless already connected,
    /// already trying, or refused by the connection gate.
    pub fn connect(self: &Arc<Self>) {
        let (gen, addr) = {
            let mut inner = self.lock();
            if inner.link.is_some() || inner.connecting {
                return;
            }
            let Some(hive) = self.hivemind.upgrade() else {
                return;
            };
            if !hive.allow_connect() {
                return;
            }
            inner.connecting = true;
            inner.conn_gen += 1;
            (inner.conn_gen, inner.addr.clone())
        };

        tracing::debug!(%addr, "establishing connection");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.transport.connect(&addr).await {
                Ok(link) => this.on_connected(gen, link),
                Err(err) => this.on_connect_fail(gen, &addr, &err.to_string()),
            }
        });
    }

    /// Re-address this node: if `addr` differs from the current address,
    /// disconnect and reconnect to the new one; otherwise just ensure a
    /// connection exists.
    pub fn connect_to(self: &Arc<Self>, addr: LinkAddr) {
        let reconnect = {
            let inner = self.lock();
            inner.addr != addr
        };
        if reconnect {
            tracing::debug!(new = %addr, "address changed, reconnecting");
            self.disconnect();
            self.lock().addr = addr;
        }
        self.connect();
    }

    pub fn disconnect(&self) {
        let mut inner = self.lock();
        tracing::debug!(addr = %inner.addr, "disconnecting");
        self.connected.store(false, Ordering::Relaxed);
        inner.connecting = false;
        inner.conn_gen += 1;
        if let Some(link) = inner.link.take() {
            link.close();
        }
    }

    fn on_connected(self: Arc<Self>, gen: u64, link: Arc<dyn Link>) {
        let lost = {
            let mut inner = self.lock();
            inner.cooldown_fails = 0;
            inner.cooldown_until = None;

            if inner.conn_gen != gen {
                // The slot was swapped from under us (disconnect or
                // re-address raced the handshake); drop this connection.
                link.close();
                true
            } else {
                tracing::debug!(addr = %inner.addr, "connection established");
                inner.connecting = false;
                inner.link = Some(link);
                // Force a full resubscription pass: every queued account is
                // overdue as of right now.
                for entry in inner.queue.iter_mut() {
                    entry.1 = 0;
                }
                self.connected.store(true, Ordering::Relaxed);
                false
            }
        };

        if let Some(hive) = self.hivemind.upgrade() {
            hive.finished_connect();
            if !lost {
                hive.check_my_subs(&self, true);
            }
        }
    }

    fn on_connect_fail(self: Arc<Self>, gen: u64, addr: &LinkAddr, reason: &str) {
        {
            let mut inner = self.lock();
            let cooldown = CONNECT_COOLDOWN[inner.cooldown_fails.min(CONNECT_COOLDOWN.len() - 1)];
            inner.cooldown_until = Some(Instant::now() + cooldown);
            inner.cooldown_fails += 1;
            tracing::warn!(
                %addr,
                fails = inner.cooldown_fails,
                retry_in = cooldown.as_secs(),
                "connection failed: {reason}"
            );
            self.connected.store(false, Ordering::Relaxed);
            if inner.conn_gen == gen {
                inner.connecting = false;
                inner.link = None;
            }
        }

        if let Some(hive) = self.hivemind.upgrade() {
            hive.finished_connect();
        }
    }

    /// Schedule `account` for subscription on this node. New accounts go to
    /// the queue front as overdue; with `force_now` an existing entry is
    /// scavenged and re-queued at the front instead.
    pub fn add_account(&self, account: &SwarmPubkey, force_now: bool) {
        let mut inner = self.lock();
        if inner.subs.insert(account.clone()) {
            inner.queue.push_front((Some(account.clone()), 0));
        } else if force_now {
            for (acc, _) in inner.queue.iter_mut() {
                if acc.as_ref() == Some(account) {
                    *acc = None; // lazy deletion
                    break;
                }
            }
            inner.queue.push_front((Some(account.clone()), 0));
        }
    }

    /// This node moved to a different swarm: drop all subscription state
    /// and adopt the new id.
    pub fn reset_swarm(&self, new_swarm: u64) {
        let mut inner = self.lock();
        inner.queue.clear();
        inner.subs.clear();
        self.swarm.store(new_swarm, Ordering::Relaxed);
    }

    /// The network swarm list changed: recompute each subscriber's swarm
    /// and eject those that no longer belong here. Adding new members is
    /// the caller's job.
    pub fn remove_stale_swarm_members(&self, swarm_ids: &[u64]) {
        let mut inner = self.lock();
        let my_swarm = self.swarm();
        for sub in &inner.subs {
            // In-place update through the shared reference; the set hashes
            // by account id only.
            sub.update_swarm(swarm_ids);
        }
        let Inner { subs, queue, .. } = &mut *inner;
        for (acc, _) in queue.iter_mut() {
            if let Some(account) = acc {
                account.update_swarm(swarm_ids);
                if account.swarm() != my_swarm {
                    subs.remove(account);
                    *acc = None;
                }
            }
        }
    }

    /// Number of accounts currently subscribed on this node.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subs.len()
    }

    /// Whether `account` is subscribed on this node.
    pub fn has_account(&self, account: &SwarmPubkey) -> bool {
        self.lock().subs.contains(account)
    }

    /// Snapshot of the resubscribe queue's `(live, due)` entries.
    pub fn queue_snapshot(&self) -> Vec<(Option<SwarmPubkey>, i64)> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Drain due queue entries into one `monitor.messages` batch and send
    /// it.
    ///
    /// `all_subs` is the engine's master subscription table. When `initial`
    /// is set and the batch filled to the size limit, another pass is
    /// requested as soon as the reply arrives, so bulk startup runs as a
    /// chain of back-to-back full batches with at most one in flight. In
    /// `fast` mode only force-queued (epoch due time) entries are
    /// considered.
    pub fn check_subs(
        self: &Arc<Self>,
        all_subs: &HashMap<SwarmPubkey, Vec<Subscription>>,
        initial: bool,
        fast: bool,
    ) {
        if !self.connected() {
            {
                let mut inner = self.lock();
                if inner.link.is_some() || inner.connecting {
                    return; // already trying
                }
                if let Some(until) = inner.cooldown_until {
                    if until > Instant::now() {
                        return;
                    }
                    inner.cooldown_until = None;
                }
            }
            // check_subs will run again once the connection lands.
            self.connect();
            return;
        }

        let now = unix_timestamp();
        let mut body = b"l".to_vec();
        let mut req_count = 0usize;

        let link = {
            let mut inner = self.lock();
            let Some(link) = inner.link.clone() else {
                return;
            };

            let mut requeue_count = 0usize;
            loop {
                if body.len() >= SUBS_REQUEST_LIMIT {
                    break;
                }
                let Some((acct, due)) = inner.queue.front() else {
                    break;
                };
                if *due > now || (fast && *due > 0) {
                    break;
                }
                let Some(acct) = acct.clone() else {
                    inner.queue.pop_front(); // lazily-deleted entry
                    continue;
                };

                let Some(subs) = all_subs.get(&acct) else {
                    inner.queue.pop_front();
                    continue;
                };

                for sub in subs {
                    encode_monitor_entry(&mut body, &acct, sub);
                    req_count += 1;
                }

                let delay = rand::thread_rng().gen_range(
                    RESUBSCRIBE_MIN.as_secs() as i64..=RESUBSCRIBE_MAX.as_secs() as i64,
                );
                inner.queue.push_back((Some(acct), now + delay));
                requeue_count += 1;
                inner.queue.pop_front();
            }

            if body.len() == 1 {
                return; // nothing due
            }
            body.push(b'e');

            resort_tail(&mut inner.queue, requeue_count, now);
            link
        };

        let size_limited = body.len() >= SUBS_REQUEST_LIMIT;
        let addr = self.lock().addr.clone();
        tracing::debug!(count = req_count, %addr, "(re-)subscribing accounts");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = link.request("monitor.messages", vec![body]).await {
                // Ignored beyond logging: swarm redundancy covers a lapsed
                // subscription on one member.
                tracing::debug!(%addr, "monitor.messages failed: {err}");
            }
            if initial && size_limited {
                if let Some(hive) = this.hivemind.upgrade() {
                    hive.check_my_subs(&this, true);
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("snode lock")
    }
}

/// Append one bencoded subscription dict. Keys are emitted in strict ASCII
/// order, which is what the dict representation guarantees.
fn encode_monitor_entry(body: &mut Vec<u8>, account: &SwarmPubkey, sub: &Subscription) {
    let mut dict = std::collections::BTreeMap::new();
    if account.session_ed {
        dict.insert(b"P".to_vec(), Value::from(&account.ed25519.0[..]));
    }
    match &sub.auth {
        Auth::Subaccount(subaccount) => {
            dict.insert(b"S".to_vec(), Value::from(&subaccount.sig.0[..]));
            dict.insert(b"T".to_vec(), Value::from(&subaccount.tag.0[..]));
        }
        Auth::Account | Auth::Subkey(_) => {}
    }
    if sub.want_data {
        dict.insert(b"d".to_vec(), Value::Int(1));
    }
    dict.insert(
        b"n".to_vec(),
        Value::List(sub.namespaces.iter().map(|&ns| Value::Int(ns as i64)).collect()),
    );
    if !account.session_ed {
        dict.insert(b"p".to_vec(), Value::from(&account.id.0[..]));
    }
    dict.insert(b"s".to_vec(), Value::from(&sub.sig.0[..]));
    dict.insert(b"t".to_vec(), Value::Int(sub.sig_ts));
    Value::Dict(dict).encode_into(body);
}

/// The jittered delays mean the `requeued` tail is unsorted. Everything
/// before it is already ordered, so only re-sort from the first entry that
/// could interleave with the new tail.
fn resort_tail(queue: &mut VecDeque<(Option<SwarmPubkey>, i64)>, requeued: usize, now: i64) {
    if requeued == 0 {
        return;
    }
    let stable = queue.len() - requeued;
    let cutoff = now + RESUBSCRIBE_MIN.as_secs() as i64;
    let start = (0..stable)
        .find(|&i| queue[i].1 >= cutoff)
        .unwrap_or(stable);

    let mut tail: Vec<_> = queue.drain(start..).collect();
    tail.sort_by_key(|entry| entry.1);
    queue.extend(tail);

    debug_assert!(queue.iter().zip(queue.iter().skip(1)).all(|(a, b)| a.1 <= b.1));
}
