//! Subscription table queries.

use rusqlite::{params, Connection, OptionalExtension};
use spns_types::{AccountId, Ed25519Pk, EncKey, Signature, SubaccountTag, SubkeyTag};

use crate::queries::{fixed, fixed_opt};
use crate::Result;

/// Field set written on insert or renewal.
pub struct SubscriptionWrite<'a> {
    pub account: &'a AccountId,
    pub session_ed25519: Option<&'a Ed25519Pk>,
    pub subkey_tag: Option<&'a SubkeyTag>,
    pub subaccount_tag: Option<&'a SubaccountTag>,
    pub subaccount_sig: Option<&'a Signature>,
    pub signature: &'a Signature,
    pub signature_ts: i64,
    pub want_data: bool,
    pub enc_key: &'a EncKey,
    pub service: &'a str,
    pub svcid: &'a str,
    pub svcdata: Option<&'a [u8]>,
}

/// An existing row located by its `(account, service, svcid)` key.
pub struct ExistingSubscription {
    pub id: i64,
    pub namespaces: Vec<i16>,
}

/// A stored subscription, as streamed at startup.
pub struct StoredSubscription {
    pub account: AccountId,
    pub session_ed25519: Option<Ed25519Pk>,
    pub subkey_tag: Option<SubkeyTag>,
    pub subaccount_tag: Option<SubaccountTag>,
    pub subaccount_sig: Option<Signature>,
    pub signature: Signature,
    pub signature_ts: i64,
    pub want_data: bool,
    pub namespaces: Vec<i16>,
}

/// A notification target row for an incoming message.
pub struct NotifyTarget {
    pub want_data: bool,
    pub enc_key: EncKey,
    pub service: String,
    pub svcid: String,
    pub svcdata: Option<Vec<u8>>,
}

/// Correlated subquery rendering a row's namespaces as an ordered CSV.
const NS_CSV: &str = "(SELECT group_concat(namespace) FROM \
     (SELECT namespace FROM sub_namespaces WHERE subscription = subscriptions.id \
      ORDER BY namespace))";

/// Look up a subscription by its unique key.
pub fn find(
    conn: &Connection,
    account: &AccountId,
    service: &str,
    svcid: &str,
) -> Result<Option<ExistingSubscription>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, {NS_CSV} FROM subscriptions \
                 WHERE account = ?1 AND service = ?2 AND svcid = ?3"
            ),
            params![account.as_ref(), service, svcid],
            |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            },
        )
        .optional()?;

    Ok(row.map(|(id, csv)| ExistingSubscription {
        id,
        namespaces: parse_ns_csv(csv.as_deref()),
    }))
}

/// Insert a brand new subscription row, returning its id.
pub fn insert(conn: &Connection, sub: &SubscriptionWrite<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO subscriptions \
         (account, session_ed25519, subkey_tag, subaccount_tag, subaccount_sig, \
          signature, signature_ts, want_data, enc_key, service, svcid, svcdata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            sub.account.as_ref(),
            sub.session_ed25519.map(AsRef::as_ref),
            sub.subkey_tag.map(AsRef::as_ref),
            sub.subaccount_tag.map(AsRef::as_ref),
            sub.subaccount_sig.map(AsRef::as_ref),
            sub.signature.as_ref(),
            sub.signature_ts,
            sub.want_data,
            sub.enc_key.as_ref(),
            sub.service,
            sub.svcid,
            sub.svcdata,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Refresh an existing row's signature and auth material.
pub fn update(conn: &Connection, id: i64, sub: &SubscriptionWrite<'_>) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET \
         session_ed25519 = ?2, subkey_tag = ?3, subaccount_tag = ?4, subaccount_sig = ?5, \
         signature = ?6, signature_ts = ?7, want_data = ?8, enc_key = ?9, svcdata = ?10 \
         WHERE id = ?1",
        params![
            id,
            sub.session_ed25519.map(AsRef::as_ref),
            sub.subkey_tag.map(AsRef::as_ref),
            sub.subaccount_tag.map(AsRef::as_ref),
            sub.subaccount_sig.map(AsRef::as_ref),
            sub.signature.as_ref(),
            sub.signature_ts,
            sub.want_data,
            sub.enc_key.as_ref(),
            sub.svcdata,
        ],
    )?;
    Ok(())
}

/// Drop every namespace row for a subscription.
pub fn clear_namespaces(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM sub_namespaces WHERE subscription = ?1", [id])?;
    Ok(())
}

/// Insert the namespace rows for a subscription.
pub fn insert_namespaces(conn: &Connection, id: i64, namespaces: &[i16]) -> Result<()> {
    let mut stmt =
        conn.prepare("INSERT INTO sub_namespaces (subscription, namespace) VALUES (?1, ?2)")?;
    for ns in namespaces {
        stmt.execute(params![id, ns])?;
    }
    Ok(())
}

/// Delete a subscription by its unique key; returns whether a row existed.
pub fn delete(
    conn: &Connection,
    account: &AccountId,
    service: &str,
    svcid: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM subscriptions WHERE account = ?1 AND service = ?2 AND svcid = ?3",
        params![account.as_ref(), service, svcid],
    )?;
    Ok(affected > 0)
}

/// Delete rows whose signature timestamp is at or before `cutoff_ts`.
pub fn delete_expired(conn: &Connection, cutoff_ts: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM subscriptions WHERE signature_ts <= ?1",
        [cutoff_ts],
    )?)
}

/// Total subscription rows.
pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))?)
}

/// Per-service subscription counts.
pub fn counts_by_service(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare("SELECT service, COUNT(*) FROM subscriptions GROUP BY service")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

/// Stream every stored subscription through `visit`.
pub fn for_each(
    conn: &Connection,
    mut visit: impl FnMut(StoredSubscription) -> Result<()>,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT account, session_ed25519, subkey_tag, subaccount_tag, subaccount_sig, \
         signature, signature_ts, want_data, {NS_CSV} \
         FROM subscriptions"
    ))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        visit(StoredSubscription {
            account: fixed("account", row.get(0)?)?,
            session_ed25519: fixed_opt("session_ed25519", row.get(1)?)?,
            subkey_tag: fixed_opt("subkey_tag", row.get(2)?)?,
            subaccount_tag: fixed_opt("subaccount_tag", row.get(3)?)?,
            subaccount_sig: fixed_opt("subaccount_sig", row.get(4)?)?,
            signature: fixed("signature", row.get(5)?)?,
            signature_ts: row.get(6)?,
            want_data: row.get(7)?,
            namespaces: parse_ns_csv(row.get::<_, Option<String>>(8)?.as_deref()),
        })?;
    }
    Ok(())
}

/// All subscriptions for `account` whose namespace set contains `namespace`.
pub fn matching_notification(
    conn: &Connection,
    account: &AccountId,
    namespace: i16,
) -> Result<Vec<NotifyTarget>> {
    let mut stmt = conn.prepare(
        "SELECT want_data, enc_key, service, svcid, svcdata FROM subscriptions \
         WHERE account = ?1 AND EXISTS(SELECT 1 FROM sub_namespaces \
             WHERE subscription = id AND namespace = ?2)",
    )?;
    let mut rows = stmt.query(params![account.as_ref(), namespace])?;
    let mut targets = Vec::new();
    while let Some(row) = rows.next()? {
        targets.push(NotifyTarget {
            want_data: row.get(0)?,
            enc_key: fixed("enc_key", row.get(1)?)?,
            service: row.get(2)?,
            svcid: row.get(3)?,
            svcdata: row.get(4)?,
        });
    }
    Ok(targets)
}

fn parse_ns_csv(csv: Option<&str>) -> Vec<i16> {
    csv.unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}
