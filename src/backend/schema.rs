//! Registry schema
//!
//! Created on the leader by the first `register`; standbys receive it
//! through replication.

pub const SCHEMA_SQL: &str = "
CREATE SCHEMA IF NOT EXISTS walwarden;

CREATE TABLE IF NOT EXISTS walwarden.nodes (
    node_id          INTEGER PRIMARY KEY,
    node_name        TEXT    NOT NULL UNIQUE,
    type             TEXT    NOT NULL CHECK (type IN ('leader', 'standby', 'witness')),
    upstream_node_id INTEGER NULL REFERENCES walwarden.nodes (node_id) DEFERRABLE,
    conninfo         TEXT    NOT NULL,
    ssh_target       TEXT    NOT NULL,
    slot_name        TEXT    NOT NULL DEFAULT '',
    priority         INTEGER NOT NULL DEFAULT 100 CHECK (priority >= 0),
    active           BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS walwarden.events (
    event_id        UUID        PRIMARY KEY,
    node_id         INTEGER     NOT NULL,
    event           TEXT        NOT NULL,
    successful      BOOLEAN     NOT NULL,
    event_timestamp TIMESTAMPTZ NOT NULL,
    details         TEXT        NOT NULL
);

CREATE TABLE IF NOT EXISTS walwarden.monitoring_history (
    standby_node_id           INTEGER     NOT NULL,
    upstream_node_id          INTEGER     NOT NULL,
    sampled_at                TIMESTAMPTZ NOT NULL,
    upstream_wal_lsn          PG_LSN      NOT NULL,
    receive_lsn               PG_LSN      NOT NULL,
    replay_lsn                PG_LSN      NOT NULL,
    replication_lag_secs      BIGINT      NOT NULL
);

CREATE INDEX IF NOT EXISTS monitoring_history_sampled_at
    ON walwarden.monitoring_history (sampled_at);
";

pub const NODE_COLUMNS: &str =
    "node_id, node_name, type, upstream_node_id, conninfo, ssh_target, slot_name, priority, active";
