//! Statistics: notifier-reported counters, the JSON snapshot, and the
//! periodic status line.

use std::time::{Duration, Instant};

use spns_db::queries::stats as stat_queries;
use spns_db::queries::subscriptions as sub_queries;
use spns_transport::bencode::Value;
use spns_transport::link::Incoming;

use crate::hivemind::HiveMind;
use crate::{unix_timestamp, HiveError, Result};

/// A `last.<service>` heartbeat younger than this counts as alive.
const ALIVE_WINDOW: i64 = 60;

/// Minimum spacing of info-level status lines.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(4 * 60 + 55);

impl HiveMind {
    /// `admin.service_stats`: two parts, the service name and a bencoded
    /// dict of values. Integer values under a `+`-prefixed key increment
    /// the stat named without the prefix; other integers and strings
    /// replace the stored value.
    pub(crate) fn on_service_stats(&self, msg: &mut Incoming) -> Result<()> {
        if msg.parts.len() != 2 {
            tracing::warn!("invalid service_stats call: expected 2-part message");
            return Ok(());
        }
        let Ok(service) = std::str::from_utf8(&msg.parts[0]) else {
            tracing::warn!("service stats received non-utf8 service name");
            return Ok(());
        };
        if service.is_empty() {
            tracing::warn!("service stats received illegal empty service name");
            return Ok(());
        }

        if let Err(err) = self.ingest_service_stats(service, &msg.parts[1]) {
            tracing::warn!("invalid service stats data: {err}");
        }
        Ok(())
    }

    fn ingest_service_stats(&self, service: &str, data: &[u8]) -> Result<()> {
        let value = Value::decode(data)
            .map_err(|e| HiveError::BadInput(format!("undecodable stats dict: {e}")))?;
        let dict = value
            .as_dict()
            .ok_or_else(|| HiveError::BadInput("stats payload is not a dict".into()))?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction().map_err(spns_db::DbError::from)?;

        stat_queries::set_int(&tx, "", &format!("last.{service}"), unix_timestamp())?;
        for (key, val) in dict {
            let name = String::from_utf8_lossy(key);
            match (name.strip_prefix('+'), val) {
                (Some(counter), Value::Int(delta)) => {
                    stat_queries::increment(&tx, service, counter, *delta)?;
                }
                (Some(_), _) => {
                    return Err(HiveError::BadInput(
                        "incremental stats values must be integers".into(),
                    ));
                }
                (None, Value::Int(v)) => stat_queries::set_int(&tx, service, &name, *v)?,
                (None, Value::Bytes(v)) => {
                    stat_queries::set_str(&tx, service, &name, &String::from_utf8_lossy(v))?;
                }
                (None, _) => {
                    return Err(HiveError::BadInput(
                        "stats values must be string or int".into(),
                    ));
                }
            }
        }
        tx.commit().map_err(spns_db::DbError::from)?;
        Ok(())
    }

    /// `admin.get_stats`: reply with the JSON snapshot.
    pub(crate) fn on_get_stats(&self, msg: &mut Incoming) -> Result<()> {
        let stats = self.get_stats_json()?;
        if let Some(responder) = msg.responder.take() {
            responder.reply_json(&stats);
        }
        Ok(())
    }

    /// Build the stats snapshot: stored counters, per-service subscription
    /// counts, and the engine's live connection/swarm numbers.
    pub fn get_stats_json(&self) -> Result<serde_json::Value> {
        let mut result = serde_json::Map::new();

        {
            let conn = self.pool.get()?;
            let now = unix_timestamp();
            for row in stat_queries::all(&conn)? {
                let value = match (row.val_str, row.val_int) {
                    (Some(s), _) => serde_json::Value::from(s),
                    (None, Some(i)) => serde_json::Value::from(i),
                    (None, None) => continue,
                };
                if row.service.is_empty() {
                    if let (Some(service), Some(ts)) =
                        (row.name.strip_prefix("last."), value.as_i64())
                    {
                        result.insert(
                            format!("alive.{service}"),
                            serde_json::Value::Bool(ts > now - ALIVE_WINDOW),
                        );
                    }
                    result.insert(row.name, value);
                } else {
                    let notifiers = result
                        .entry("notifier")
                        .or_insert_with(|| serde_json::json!({}));
                    notifiers[row.service.as_str()][row.name.as_str()] = value;
                }
            }

            let mut total = 0i64;
            let mut by_service = serde_json::Map::new();
            for (service, count) in sub_queries::counts_by_service(&conn)? {
                by_service.insert(service, serde_json::Value::from(count));
                total += count;
            }
            by_service.insert("total".into(), serde_json::Value::from(total));
            result.insert("subscriptions".into(), by_service.into());
        }

        {
            let state = self.lock_state();
            let connections = state
                .sns_by_pubkey
                .values()
                .filter(|sn| sn.connected())
                .count();
            result.insert("block_hash".into(), state.last_block.0.clone().into());
            result.insert("block_height".into(), state.last_block.1.into());
            result.insert("swarms".into(), state.swarms.len().into());
            result.insert("snodes".into(), state.sns_by_pubkey.len().into());
            result.insert(
                "accounts_monitored".into(),
                state.subscribers.len().into(),
            );
            result.insert("connections".into(), connections.into());
            result.insert(
                "pending_connections".into(),
                self.pending_connects
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .into(),
            );
            result.insert(
                "uptime".into(),
                self.startup_instant.elapsed().as_secs_f64().into(),
            );
        }

        Ok(result.into())
    }

    /// Emit the one-line status summary; info level at most once per
    /// [`STATS_LOG_INTERVAL`], debug otherwise.
    pub fn log_stats(&self) {
        let stats = match self.get_stats_json() {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!("failed to collect stats: {err}");
                return;
            }
        };

        let mut live_notifiers: Vec<&str> = Vec::new();
        if let Some(obj) = stats.as_object() {
            for (key, val) in obj {
                if let (Some(service), Some(ts)) = (key.strip_prefix("last."), val.as_i64()) {
                    if ts >= self.startup_unix && ts >= unix_timestamp() - ALIVE_WINDOW {
                        live_notifiers.push(service);
                    }
                }
            }
        }

        let mut total_notifies = 0i64;
        if let Some(notifiers) = stats.get("notifier").and_then(|v| v.as_object()) {
            for data in notifiers.values() {
                total_notifies += data.get("notifies").and_then(|v| v.as_i64()).unwrap_or(0);
            }
        }

        let line = format!(
            "SN conns: {}/{} ({} pending); Height: {}; Accts/Subs: {}/{}; svcs: {}; notifies: {}",
            stats["connections"],
            stats["snodes"],
            stats["pending_connections"],
            stats["block_height"],
            stats["accounts_monitored"],
            stats["subscriptions"]["total"],
            live_notifiers.join(", "),
            total_notifies,
        );

        let mut last = self.last_stats_logged.lock().expect("stats lock");
        if last.map_or(true, |at| at.elapsed() >= STATS_LOG_INTERVAL) {
            tracing::info!("status: {line}");
            *last = Some(Instant::now());
        } else {
            tracing::debug!("status: {line}");
        }
    }
}
