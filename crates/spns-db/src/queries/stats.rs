//! Service statistics counters.
//!
//! Rows are keyed `(service, name)` and hold either an integer or a string
//! value; writes are upserts so counters work without initialization. The
//! empty service name holds the server's own counters.

use rusqlite::{params, Connection};

use crate::Result;

/// A statistics row.
pub struct StatRow {
    pub service: String,
    pub name: String,
    pub val_str: Option<String>,
    pub val_int: Option<i64>,
}

/// Set a string-valued stat, replacing any previous value.
pub fn set_str(conn: &Connection, service: &str, name: &str, val: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO service_stats (service, name, val_str) VALUES (?1, ?2, ?3) \
         ON CONFLICT (service, name) DO UPDATE \
             SET val_str = excluded.val_str, val_int = NULL",
        params![service, name, val],
    )?;
    Ok(())
}

/// Set an integer-valued stat, replacing any previous value.
pub fn set_int(conn: &Connection, service: &str, name: &str, val: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO service_stats (service, name, val_int) VALUES (?1, ?2, ?3) \
         ON CONFLICT (service, name) DO UPDATE \
             SET val_str = NULL, val_int = excluded.val_int",
        params![service, name, val],
    )?;
    Ok(())
}

/// Add `delta` to an integer stat, treating a missing or string value as 0.
pub fn increment(conn: &Connection, service: &str, name: &str, delta: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO service_stats (service, name, val_int) VALUES (?1, ?2, ?3) \
         ON CONFLICT (service, name) DO UPDATE \
             SET val_str = NULL, \
                 val_int = COALESCE(service_stats.val_int, 0) + excluded.val_int",
        params![service, name, delta],
    )?;
    Ok(())
}

/// Every statistics row.
pub fn all(conn: &Connection) -> Result<Vec<StatRow>> {
    let mut stmt = conn.prepare("SELECT service, name, val_str, val_int FROM service_stats")?;
    let rows = stmt.query_map([], |row| {
        Ok(StatRow {
            service: row.get(0)?,
            name: row.get(1)?,
            val_str: row.get(2)?,
            val_int: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pool;

    #[test]
    fn increment_starts_from_zero() {
        let pool = Pool::open_in_memory().expect("pool");
        let conn = pool.get().expect("conn");

        increment(&conn, "", "notifications", 1).expect("incr");
        increment(&conn, "", "notifications", 2).expect("incr");

        let rows = all(&conn).expect("all");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].val_int, Some(3));
        assert_eq!(rows[0].val_str, None);
    }

    #[test]
    fn set_replaces_value_and_kind() {
        let pool = Pool::open_in_memory().expect("pool");
        let conn = pool.get().expect("conn");

        set_int(&conn, "apns", "mode", 1).expect("int");
        set_str(&conn, "apns", "mode", "sandbox").expect("str");

        let rows = all(&conn).expect("all");
        assert_eq!(rows[0].val_str.as_deref(), Some("sandbox"));
        assert_eq!(rows[0].val_int, None);

        // Incrementing a string stat restarts the counter from zero.
        increment(&conn, "apns", "mode", 5).expect("incr");
        let rows = all(&conn).expect("all");
        assert_eq!(rows[0].val_int, Some(5));
    }

    #[test]
    fn services_are_independent() {
        let pool = Pool::open_in_memory().expect("pool");
        let conn = pool.get().expect("conn");

        increment(&conn, "", "subscription", 1).expect("global");
        increment(&conn, "apns", "subscription", 1).expect("apns");

        let rows = all(&conn).expect("all");
        assert_eq!(rows.len(), 2);
    }
}
