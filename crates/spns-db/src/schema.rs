//! SQL schema definitions.

/// Complete v1 schema.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY,
    account BLOB NOT NULL CHECK (length(account) = 33),
    session_ed25519 BLOB CHECK (session_ed25519 IS NULL OR length(session_ed25519) = 32),
    subkey_tag BLOB CHECK (subkey_tag IS NULL OR length(subkey_tag) = 32),
    subaccount_tag BLOB CHECK (subaccount_tag IS NULL OR length(subaccount_tag) = 36),
    subaccount_sig BLOB CHECK (subaccount_sig IS NULL OR length(subaccount_sig) = 64),
    signature BLOB NOT NULL CHECK (length(signature) = 64),
    signature_ts INTEGER NOT NULL,
    want_data INTEGER NOT NULL DEFAULT 0,
    enc_key BLOB NOT NULL CHECK (length(enc_key) = 32),
    service TEXT NOT NULL,
    svcid TEXT NOT NULL,
    svcdata BLOB,
    -- A subaccount credential is both parts or neither
    CHECK ((subaccount_tag IS NULL) = (subaccount_sig IS NULL)),
    UNIQUE (account, service, svcid)
);

CREATE INDEX IF NOT EXISTS subscriptions_ts_idx ON subscriptions(signature_ts);

CREATE TABLE IF NOT EXISTS sub_namespaces (
    subscription INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
    namespace INTEGER NOT NULL CHECK (namespace BETWEEN -32768 AND 32767),
    UNIQUE (subscription, namespace)
);

CREATE INDEX IF NOT EXISTS sub_namespaces_sub_idx ON sub_namespaces(subscription);

CREATE TABLE IF NOT EXISTS service_stats (
    service TEXT NOT NULL,
    name TEXT NOT NULL,
    val_str TEXT,
    val_int INTEGER,
    PRIMARY KEY (service, name),
    -- Exactly one of the two value columns is set
    CHECK ((val_str IS NULL) != (val_int IS NULL))
);
"#;
