//! PostgreSQL connection
//!
//! `tokio-postgres` driven by a private current-thread runtime. Every call
//! blocks until the query completes, so the engine above stays synchronous.
//! The connection future is spawned on the same runtime and only makes
//! progress while a query is being awaited.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

use super::schema::{NODE_COLUMNS, SCHEMA_SQL};
use crate::error::{ClusterError, ClusterResult};
use crate::lsn::Lsn;
use crate::monitor::{
    AttachedStandby, Connector, NodeConnection, RecoveryState, ReplicationCapacity, SlotInfo,
    WalPositions,
};
use crate::observability::Logger;
use crate::registry::{
    Demotion, EventKind, EventRecord, MonitoringSample, NodeChange, NodeCondition, NodeId,
    NodeRecord, NodeRegistry,
};

/// Opens [`PgConnection`]s.
pub struct PgConnector {
    runtime: Arc<Runtime>,
}

impl PgConnector {
    pub fn new() -> ClusterResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

impl Connector for PgConnector {
    fn connect(&self, target: &str) -> ClusterResult<Box<dyn NodeConnection>> {
        let (client, connection) = self
            .runtime
            .block_on(tokio_postgres::connect(target, NoTls))
            .map_err(|e| ClusterError::unreachable(target, describe(&e)))?;
        self.runtime.spawn(async move {
            // Ends when the client is dropped or the server goes away.
            let _ = connection.await;
        });
        Ok(Box::new(PgConnection {
            runtime: Arc::clone(&self.runtime),
            client,
            target: target.to_string(),
        }))
    }
}

/// One open database connection.
pub struct PgConnection {
    runtime: Arc<Runtime>,
    client: Client,
    target: String,
}

/// Message of a driver error, preferring the server's own text.
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

fn node_id(value: i32) -> ClusterResult<NodeId> {
    u32::try_from(value)
        .map(NodeId)
        .map_err(|_| ClusterError::Protocol(format!("invalid node id {}", value)))
}

/// Node ids are `int4` in the catalog.
fn db_node_id(id: NodeId) -> ClusterResult<i32> {
    i32::try_from(id.0).map_err(|_| {
        ClusterError::config(format!("node id {} does not fit the catalog's int4 column", id))
    })
}

fn lsn(text: Option<String>) -> ClusterResult<Lsn> {
    match text {
        Some(text) => text.parse(),
        None => Ok(Lsn::INVALID),
    }
}

fn node_from_row(row: &Row) -> ClusterResult<NodeRecord> {
    let role: String = row.try_get("type").map_err(ClusterError::query)?;
    let upstream: Option<i32> = row.try_get("upstream_node_id").map_err(ClusterError::query)?;
    let priority: i32 = row.try_get("priority").map_err(ClusterError::query)?;
    Ok(NodeRecord {
        id: node_id(row.try_get("node_id").map_err(ClusterError::query)?)?,
        name: row.try_get("node_name").map_err(ClusterError::query)?,
        role: role.parse()?,
        upstream_id: upstream.map(node_id).transpose()?,
        connection_target: row.try_get("conninfo").map_err(ClusterError::query)?,
        ssh_target: row.try_get("ssh_target").map_err(ClusterError::query)?,
        slot_name: row.try_get("slot_name").map_err(ClusterError::query)?,
        priority: u32::try_from(priority).unwrap_or(0),
        active: row.try_get("active").map_err(ClusterError::query)?,
    })
}

/// Switch point of `timeline` in a timeline history file.
///
/// History lines are `<parent tli>\t<switch lsn>\t<reason>`.
pub(crate) fn parse_timeline_history(history: &str, timeline: u32) -> Option<Lsn> {
    history.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let tli: u32 = fields.next()?.parse().ok()?;
        let switch: Lsn = fields.next()?.parse().ok()?;
        (tli == timeline).then_some(switch)
    })
}

impl PgConnection {
    fn block_on<F, T>(&self, future: F) -> ClusterResult<T>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        self.runtime.block_on(future).map_err(|e| self.map_error(&e))
    }

    fn map_error(&self, err: &tokio_postgres::Error) -> ClusterError {
        if err.code() == Some(&SqlState::READ_ONLY_SQL_TRANSACTION) {
            return ClusterError::ReadOnly(self.target.clone());
        }
        if err.is_closed() {
            return ClusterError::unreachable(self.target.clone(), describe(err));
        }
        ClusterError::query(describe(err))
    }

    fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> ClusterResult<Vec<Row>> {
        self.block_on(self.client.query(sql, params))
    }

    fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> ClusterResult<Row> {
        self.block_on(self.client.query_one(sql, params))
    }

    fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> ClusterResult<u64> {
        self.block_on(self.client.execute(sql, params))
    }

    fn get<'a, T>(row: &'a Row, idx: usize) -> ClusterResult<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get(idx).map_err(ClusterError::query)
    }

    fn in_recovery(&self) -> ClusterResult<bool> {
        let row = self.query_one("SELECT pg_catalog.pg_is_in_recovery()", &[])?;
        Self::get(&row, 0)
    }
}

impl NodeConnection for PgConnection {
    fn recovery_state(&self) -> ClusterResult<RecoveryState> {
        Ok(if self.in_recovery()? {
            RecoveryState::Standby
        } else {
            RecoveryState::Leader
        })
    }

    fn wal_positions(&self) -> ClusterResult<WalPositions> {
        if !self.in_recovery()? {
            let row = self.query_one("SELECT pg_catalog.pg_current_wal_lsn()::text", &[])?;
            let current = lsn(Self::get(&row, 0)?)?;
            return Ok(WalPositions {
                receive: current,
                replay: current,
                lag_seconds: 0,
                replay_paused: false,
            });
        }
        let row = self.query_one(
            "SELECT pg_catalog.pg_last_wal_receive_lsn()::text,
                    pg_catalog.pg_last_wal_replay_lsn()::text,
                    COALESCE(EXTRACT(EPOCH FROM now() - pg_catalog.pg_last_xact_replay_timestamp()), 0)::bigint,
                    pg_catalog.pg_is_wal_replay_paused()",
            &[],
        )?;
        let lag: i64 = Self::get(&row, 2)?;
        Ok(WalPositions {
            receive: lsn(Self::get(&row, 0)?)?,
            replay: lsn(Self::get(&row, 1)?)?,
            lag_seconds: u64::try_from(lag).unwrap_or(0),
            replay_paused: Self::get(&row, 3)?,
        })
    }

    fn replication_capacity(&self) -> ClusterResult<ReplicationCapacity> {
        let row = self.query_one(
            "SELECT current_setting('max_wal_senders')::int4,
                    (SELECT count(*) FROM pg_catalog.pg_stat_replication)::int4,
                    current_setting('max_replication_slots')::int4,
                    (SELECT count(*) FROM pg_catalog.pg_replication_slots)::int4,
                    (SELECT count(*) FROM pg_catalog.pg_replication_slots WHERE active)::int4",
            &[],
        )?;
        let field = |idx: usize| -> ClusterResult<u32> {
            let value: i32 = Self::get(&row, idx)?;
            Ok(u32::try_from(value).unwrap_or(0))
        };
        Ok(ReplicationCapacity {
            max_wal_senders: field(0)?,
            used_wal_senders: field(1)?,
            max_replication_slots: field(2)?,
            used_replication_slots: field(3)?,
            active_replication_slots: field(4)?,
        })
    }

    fn attached_standbys(&self) -> ClusterResult<Vec<AttachedStandby>> {
        self.query(
            "SELECT application_name, state FROM pg_catalog.pg_stat_replication",
            &[],
        )?
        .iter()
        .map(|row| {
            Ok(AttachedStandby {
                application_name: Self::get(row, 0)?,
                state: Self::get::<Option<String>>(row, 1)?.unwrap_or_default(),
            })
        })
        .collect()
    }

    fn replication_slots(&self) -> ClusterResult<Vec<SlotInfo>> {
        self.query(
            "SELECT slot_name::text, active FROM pg_catalog.pg_replication_slots
              WHERE slot_type = 'physical' ORDER BY slot_name",
            &[],
        )?
        .iter()
        .map(|row| {
            Ok(SlotInfo {
                name: Self::get(row, 0)?,
                active: Self::get(row, 1)?,
            })
        })
        .collect()
    }

    fn create_replication_slot(&self, name: &str) -> ClusterResult<()> {
        self.query(
            "SELECT pg_catalog.pg_create_physical_replication_slot($1::text::name)
              WHERE NOT EXISTS (
                    SELECT 1 FROM pg_catalog.pg_replication_slots WHERE slot_name = $1::text::name)",
            &[&name],
        )?;
        Ok(())
    }

    fn drop_replication_slot(&self, name: &str) -> ClusterResult<bool> {
        let rows = self.query(
            "SELECT pg_catalog.pg_drop_replication_slot(slot_name)
               FROM pg_catalog.pg_replication_slots
              WHERE slot_name = $1::text::name AND NOT active",
            &[&name],
        )?;
        Ok(!rows.is_empty())
    }

    fn archive_ready_count(&self) -> ClusterResult<u64> {
        let row = self.query_one(
            "SELECT count(*) FROM pg_catalog.pg_ls_dir('pg_wal/archive_status') AS f
              WHERE f LIKE '%.ready'",
            &[],
        )?;
        let count: i64 = Self::get(&row, 0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn exclusive_backup_in_progress(&self) -> ClusterResult<bool> {
        // Exclusive backups were removed in PostgreSQL 15.
        let row = self.query_one(
            "SELECT count(*) FROM pg_catalog.pg_proc WHERE proname = 'pg_is_in_backup'",
            &[],
        )?;
        let available: i64 = Self::get(&row, 0)?;
        if available == 0 {
            return Ok(false);
        }
        let row = self.query_one("SELECT pg_catalog.pg_is_in_backup()", &[])?;
        Self::get(&row, 0)
    }

    fn data_directory(&self) -> ClusterResult<String> {
        let row = self.query_one("SELECT current_setting('data_directory')", &[])?;
        Self::get(&row, 0)
    }

    fn timeline_id(&self) -> ClusterResult<u32> {
        let row = self.query_one("SELECT timeline_id FROM pg_catalog.pg_control_checkpoint()", &[])?;
        let timeline: i32 = Self::get(&row, 0)?;
        Ok(u32::try_from(timeline).unwrap_or(0))
    }

    fn timeline_switch_lsn(&self, timeline: u32) -> ClusterResult<Option<Lsn>> {
        let current = self.timeline_id()?;
        if current <= timeline {
            return Ok(None);
        }
        let path = format!("pg_wal/{:08X}.history", current);
        let row = self.query_one("SELECT pg_catalog.pg_read_file($1::text)", &[&path])?;
        let history: String = Self::get(&row, 0)?;
        Ok(parse_timeline_history(&history, timeline))
    }

    fn checkpoint(&self) -> ClusterResult<()> {
        self.block_on(self.client.batch_execute("CHECKPOINT"))
    }

    fn promote(&self) -> ClusterResult<()> {
        let row = self.query_one("SELECT pg_catalog.pg_promote(wait => false)", &[])?;
        let accepted: bool = Self::get(&row, 0)?;
        if accepted {
            Ok(())
        } else {
            Err(ClusterError::query("pg_promote() was not accepted"))
        }
    }

    fn registry(&self) -> &dyn NodeRegistry {
        self
    }
}

/// Outcome of the leadership transfer transaction.
enum Transfer {
    Done(Row),
    Conflict(String),
}

impl PgConnection {
    async fn transfer_in_transaction(
        &self,
        candidate: i32,
        old_leader: i32,
        demotion: Demotion,
    ) -> Result<Transfer, tokio_postgres::Error> {
        let client = &self.client;
        client.batch_execute("BEGIN").await?;
        let demoted = match demotion {
            Demotion::Failed => {
                client
                    .execute(
                        "UPDATE walwarden.nodes SET active = FALSE
                          WHERE node_id = $1 AND active AND type = 'leader'",
                        &[&old_leader],
                    )
                    .await?
            }
            Demotion::Standby => {
                client
                    .execute(
                        "UPDATE walwarden.nodes SET type = 'standby', upstream_node_id = $2
                          WHERE node_id = $1 AND active AND type = 'leader'",
                        &[&old_leader, &candidate],
                    )
                    .await?
            }
        };
        if demoted != 1 {
            client.batch_execute("ROLLBACK").await?;
            return Ok(Transfer::Conflict(format!(
                "node {} is no longer the active leader",
                old_leader
            )));
        }
        let promoted = client
            .query(
                &format!(
                    "UPDATE walwarden.nodes SET type = 'leader', upstream_node_id = NULL
                      WHERE node_id = $1 AND active AND type = 'standby'
                  RETURNING {}",
                    NODE_COLUMNS
                ),
                &[&candidate],
            )
            .await?;
        match promoted.into_iter().next() {
            Some(row) => {
                client.batch_execute("COMMIT").await?;
                Ok(Transfer::Done(row))
            }
            None => {
                client.batch_execute("ROLLBACK").await?;
                Ok(Transfer::Conflict(format!(
                    "node {} is no longer an active standby",
                    candidate
                )))
            }
        }
    }
}

impl NodeRegistry for PgConnection {
    fn node(&self, id: NodeId) -> ClusterResult<Option<NodeRecord>> {
        let sql = format!("SELECT {} FROM walwarden.nodes WHERE node_id = $1", NODE_COLUMNS);
        let id = db_node_id(id)?;
        self.query(&sql, &[&id])?
            .first()
            .map(node_from_row)
            .transpose()
    }

    fn nodes(&self) -> ClusterResult<Vec<NodeRecord>> {
        let sql = format!("SELECT {} FROM walwarden.nodes ORDER BY node_id", NODE_COLUMNS);
        self.query(&sql, &[])?.iter().map(node_from_row).collect()
    }

    fn register(&self, record: &NodeRecord, replace: bool) -> ClusterResult<()> {
        self.block_on(self.client.batch_execute(SCHEMA_SQL))?;
        let conflict = if replace {
            "ON CONFLICT (node_id) DO UPDATE SET
                node_name = EXCLUDED.node_name, type = EXCLUDED.type,
                upstream_node_id = EXCLUDED.upstream_node_id, conninfo = EXCLUDED.conninfo,
                ssh_target = EXCLUDED.ssh_target, slot_name = EXCLUDED.slot_name,
                priority = EXCLUDED.priority, active = EXCLUDED.active"
        } else {
            "ON CONFLICT (node_id) DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO walwarden.nodes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) {}",
            NODE_COLUMNS, conflict
        );
        let id = db_node_id(record.id)?;
        let upstream = record.upstream_id.map(db_node_id).transpose()?;
        let priority = i32::try_from(record.priority).map_err(|_| {
            ClusterError::config(format!("priority {} of node {} is out of range", record.priority, record.id))
        })?;
        let inserted = self.execute(
            &sql,
            &[
                &id,
                &record.name,
                &record.role.as_str(),
                &upstream,
                &record.connection_target,
                &record.ssh_target,
                &record.slot_name,
                &priority,
                &record.active,
            ],
        )?;
        if inserted == 0 {
            return Err(ClusterError::conflict(format!(
                "node {} is already registered",
                record.id
            )));
        }
        Ok(())
    }

    fn unregister(&self, id: NodeId) -> ClusterResult<bool> {
        let id = db_node_id(id)?;
        let deleted = self.execute("DELETE FROM walwarden.nodes WHERE node_id = $1", &[&id])?;
        Ok(deleted > 0)
    }

    fn update_node(
        &self,
        id: NodeId,
        expected: &NodeCondition,
        change: &NodeChange,
    ) -> ClusterResult<NodeRecord> {
        let sql = format!(
            "UPDATE walwarden.nodes
                SET type = COALESCE($2::text, type),
                    upstream_node_id = CASE WHEN $3::boolean THEN $4::int4 ELSE upstream_node_id END,
                    slot_name = COALESCE($5::text, slot_name),
                    active = COALESCE($6::boolean, active)
              WHERE node_id = $1
                AND type = $7::text
                AND upstream_node_id IS NOT DISTINCT FROM $8::int4
                AND active = $9::boolean
          RETURNING {}",
            NODE_COLUMNS
        );
        let node = db_node_id(id)?;
        let role = change.role.map(|r| r.as_str());
        let set_upstream = change.upstream_id.is_some();
        let upstream = change.upstream_id.flatten().map(db_node_id).transpose()?;
        let slot = change.slot_name.as_deref();
        let expected_role = expected.role.as_str();
        let expected_upstream = expected.upstream_id.map(db_node_id).transpose()?;
        let rows = self.query(
            &sql,
            &[
                &node,
                &role,
                &set_upstream,
                &upstream,
                &slot,
                &change.active,
                &expected_role,
                &expected_upstream,
                &expected.active,
            ],
        )?;
        match rows.first() {
            Some(row) => node_from_row(row),
            None if self.node(id)?.is_none() => Err(ClusterError::config(format!(
                "node {} is not registered",
                id
            ))),
            None => Err(ClusterError::conflict(format!(
                "node {} changed since it was read",
                id
            ))),
        }
    }

    fn transfer_leadership(
        &self,
        candidate: NodeId,
        old_leader: NodeId,
        demotion: Demotion,
    ) -> ClusterResult<NodeRecord> {
        if candidate == old_leader {
            return Err(ClusterError::config("candidate and old leader are the same node"));
        }
        let result = self.runtime.block_on(self.transfer_in_transaction(
            db_node_id(candidate)?,
            db_node_id(old_leader)?,
            demotion,
        ));
        match result {
            Ok(Transfer::Done(row)) => node_from_row(&row),
            Ok(Transfer::Conflict(message)) => Err(ClusterError::conflict(message)),
            Err(e) => {
                if let Err(rollback) = self.runtime.block_on(self.client.batch_execute("ROLLBACK")) {
                    Logger::warning(
                        "ROLLBACK_FAILED",
                        &[("operation", "transfer_leadership"), ("detail", &rollback.to_string())],
                    );
                }
                Err(self.map_error(&e))
            }
        }
    }

    fn record_event(&self, event: &EventRecord) -> ClusterResult<()> {
        let node = db_node_id(event.node_id)?;
        self.execute(
            "INSERT INTO walwarden.events
                    (event_id, node_id, event, successful, event_timestamp, details)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &event.id,
                &node,
                &event.kind.as_str(),
                &event.success,
                &event.timestamp,
                &event.details,
            ],
        )?;
        Ok(())
    }

    fn events(&self, limit: usize) -> ClusterResult<Vec<EventRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            "SELECT event_id, node_id, event, successful, event_timestamp, details
               FROM walwarden.events
              ORDER BY event_timestamp DESC
              LIMIT $1",
            &[&limit],
        )?
        .iter()
        .map(|row| {
            let name: String = Self::get(row, 2)?;
            let kind = EventKind::from_name(&name)
                .ok_or_else(|| ClusterError::Protocol(format!("unknown event \"{}\"", name)))?;
            Ok(EventRecord {
                id: Self::get(row, 0)?,
                node_id: node_id(Self::get(row, 1)?)?,
                kind,
                success: Self::get(row, 3)?,
                timestamp: Self::get(row, 4)?,
                details: Self::get(row, 5)?,
            })
        })
        .collect()
    }

    fn record_sample(&self, sample: &MonitoringSample) -> ClusterResult<()> {
        let node = db_node_id(sample.node_id)?;
        let upstream = db_node_id(sample.upstream_id)?;
        let lag = i64::try_from(sample.lag_seconds).unwrap_or(i64::MAX);
        self.execute(
            "INSERT INTO walwarden.monitoring_history
                    (standby_node_id, upstream_node_id, sampled_at,
                     upstream_wal_lsn, receive_lsn, replay_lsn, replication_lag_secs)
             VALUES ($1, $2, $3, $4::text::pg_lsn, $5::text::pg_lsn, $6::text::pg_lsn, $7)",
            &[
                &node,
                &upstream,
                &sample.sampled_at,
                &sample.upstream_lsn.to_string(),
                &sample.receive_lsn.to_string(),
                &sample.replay_lsn.to_string(),
                &lag,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY: &str = "1\t0/3000158\tno recovery target specified\n\
                           2\t0/5000000\tno recovery target specified\n";

    #[test]
    fn test_parse_timeline_history() {
        assert_eq!(
            parse_timeline_history(HISTORY, 1),
            Some("0/3000158".parse().unwrap())
        );
        assert_eq!(
            parse_timeline_history(HISTORY, 2),
            Some("0/5000000".parse().unwrap())
        );
        assert_eq!(parse_timeline_history(HISTORY, 3), None);
    }

    #[test]
    fn test_parse_timeline_history_skips_comments() {
        let history = "# comment\n\n1\t0/10\treason\n";
        assert_eq!(parse_timeline_history(history, 1), Some(Lsn::new(0x10)));
    }

    #[test]
    fn test_db_node_id_rejects_ids_beyond_int4() {
        assert_eq!(db_node_id(NodeId(7)).unwrap(), 7);
        assert_eq!(db_node_id(NodeId(i32::MAX as u32)).unwrap(), i32::MAX);
        let err = db_node_id(NodeId(u32::MAX)).unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    #[test]
    fn test_lsn_null_is_invalid() {
        assert_eq!(lsn(None).unwrap(), Lsn::INVALID);
        assert_eq!(lsn(Some("0/1A".to_string())).unwrap(), Lsn::new(0x1A));
    }
}
