//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Lease expiry is stored as
//! epoch milliseconds so that every lock decision is a single UPDATE whose
//! WHERE clause does the comparison.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::board::model::{
    AgentPreference, AgentVariant, Board, BoardEvent, Column, EventFilter, EventType, Priority,
    Run, RunFinalize, RunStatus, Ticket, TicketLock,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ClaimWrite, Database};

const TICKET_COLUMNS: &str = "id, board_id, column_id, title, description, priority, labels, project_id, agent_preference, lock_run_id, lock_expires_at_ms, version, reclaim_count, created_at, updated_at";

const RUN_COLUMNS: &str = "id, ticket_id, worker_id, agent_variant, status, started_at, ended_at, exit_code, summary, lease_duration_ms, last_heartbeat_at";

const EVENT_COLUMNS: &str = "id, event_type, board_id, ticket_id, run_id, payload, created_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| Uuid::parse_str(&s).ok())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn row_to_board(row: &libsql::Row) -> Result<Board, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("board.id: {e}")))?;
    let name: String = row.get(1).map_err(|e| DatabaseError::Query(format!("board.name: {e}")))?;
    let created: String = row.get(2).unwrap_or_default();
    Ok(Board {
        id: parse_uuid(&id, "board.id")?,
        name,
        created_at: parse_datetime(&created),
    })
}

fn row_to_column(row: &libsql::Row) -> Result<Column, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("column.id: {e}")))?;
    let board_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("column.board_id: {e}")))?;
    let name: String = row.get(2).map_err(|e| DatabaseError::Query(format!("column.name: {e}")))?;
    let position: i64 = row.get(3).unwrap_or(0);
    let wip_limit: Option<i64> = row.get::<i64>(4).ok();
    Ok(Column {
        id: parse_uuid(&id, "column.id")?,
        board_id: parse_uuid(&board_id, "column.board_id")?,
        name,
        position: position as i32,
        wip_limit: wip_limit.and_then(|l| u32::try_from(l).ok()),
    })
}

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("ticket.id: {e}")))?;
    let board_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("ticket.board_id: {e}")))?;
    let column_id: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("ticket.column_id: {e}")))?;
    let title: String = row.get(3).map_err(|e| DatabaseError::Query(format!("ticket.title: {e}")))?;
    let description: Option<String> = row.get::<String>(4).ok().filter(|s| !s.is_empty());
    let priority: String = row.get(5).unwrap_or_else(|_| "medium".to_string());
    let labels_json: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let project_id: Option<String> = row.get::<String>(7).ok().filter(|s| !s.is_empty());
    let preference: String = row.get(8).unwrap_or_else(|_| "any".to_string());
    let lock_run_id = parse_optional_uuid(row.get::<String>(9).ok());
    let lock_expires_at_ms: Option<i64> = row.get::<i64>(10).ok();
    let version: i64 = row.get(11).unwrap_or(0);
    let reclaim_count: i64 = row.get(12).unwrap_or(0);
    let created: String = row.get(13).unwrap_or_default();
    let updated: String = row.get(14).unwrap_or_default();

    let lock = match (lock_run_id, lock_expires_at_ms) {
        (Some(run_id), Some(ms)) => Some(TicketLock {
            run_id,
            lease_expires_at: from_millis(ms),
        }),
        _ => None,
    };

    Ok(Ticket {
        id: parse_uuid(&id, "ticket.id")?,
        board_id: parse_uuid(&board_id, "ticket.board_id")?,
        column_id: parse_uuid(&column_id, "ticket.column_id")?,
        title,
        description,
        priority: Priority::parse_lossy(&priority),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        project_id,
        agent_preference: AgentPreference::parse_lossy(&preference),
        lock,
        version,
        reclaim_count: u32::try_from(reclaim_count).unwrap_or(0),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<Run, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("run.id: {e}")))?;
    let ticket_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("run.ticket_id: {e}")))?;
    let status: String = row.get(4).unwrap_or_else(|_| "running".to_string());
    let started: String = row.get(5).unwrap_or_default();

    Ok(Run {
        id: parse_uuid(&id, "run.id")?,
        ticket_id: parse_uuid(&ticket_id, "run.ticket_id")?,
        worker_id: parse_optional_uuid(row.get::<String>(2).ok()),
        agent_variant: row
            .get::<String>(3)
            .ok()
            .and_then(|v| AgentVariant::parse(&v)),
        status: RunStatus::parse_lossy(&status),
        started_at: parse_datetime(&started),
        ended_at: parse_optional_datetime(row.get::<String>(6).ok()),
        exit_code: row.get::<i64>(7).ok().and_then(|c| i32::try_from(c).ok()),
        summary: row.get::<String>(8).ok(),
        lease_duration_ms: row.get::<i64>(9).ok(),
        last_heartbeat_at: parse_optional_datetime(row.get::<String>(10).ok()),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<BoardEvent, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("event.id: {e}")))?;
    let event_type: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("event.event_type: {e}")))?;
    let payload: String = row.get(5).unwrap_or_else(|_| "null".to_string());
    let created: String = row.get(6).unwrap_or_default();

    Ok(BoardEvent {
        id: parse_uuid(&id, "event.id")?,
        event_type: EventType::parse(&event_type).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown event type: {event_type}"))
        })?,
        board_id: parse_optional_uuid(row.get::<String>(2).ok()),
        ticket_id: parse_optional_uuid(row.get::<String>(3).ok()),
        run_id: parse_optional_uuid(row.get::<String>(4).ok()),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
    })
}

async fn collect_tickets(mut rows: libsql::Rows) -> Result<Vec<Ticket>, DatabaseError> {
    let mut tickets = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("ticket row: {e}")))?
    {
        tickets.push(row_to_ticket(&row)?);
    }
    Ok(tickets)
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Boards ──────────────────────────────────────────────────────

    async fn create_board(&self, board: &Board) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO boards (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    board.id.to_string(),
                    board.name.as_str(),
                    board.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_board: {e}")))?;
        debug!(id = %board.id, "Board created");
        Ok(())
    }

    async fn get_board(&self, id: Uuid) -> Result<Option<Board>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, created_at FROM boards WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_board: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_board(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_board row: {e}"))),
        }
    }

    async fn list_boards(&self) -> Result<Vec<Board>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, created_at FROM boards ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_boards: {e}")))?;

        let mut boards = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            boards.push(row_to_board(&row)?);
        }
        Ok(boards)
    }

    async fn create_column(&self, column: &Column) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO board_columns (id, board_id, name, position, wip_limit) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    column.id.to_string(),
                    column.board_id.to_string(),
                    column.name.as_str(),
                    column.position as i64,
                    opt_int(column.wip_limit.map(i64::from))
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_column: {e}")))?;
        Ok(())
    }

    async fn list_columns(&self, board_id: Uuid) -> Result<Vec<Column>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, board_id, name, position, wip_limit FROM board_columns WHERE board_id = ?1 ORDER BY position ASC",
                params![board_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_columns: {e}")))?;

        let mut columns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            columns.push(row_to_column(&row)?);
        }
        Ok(columns)
    }

    // ── Tickets ─────────────────────────────────────────────────────

    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        let labels = serde_json::to_string(&ticket.labels)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tickets ({TICKET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    ticket.id.to_string(),
                    ticket.board_id.to_string(),
                    ticket.column_id.to_string(),
                    ticket.title.as_str(),
                    opt_text(ticket.description.clone()),
                    ticket.priority.as_str(),
                    labels,
                    opt_text(ticket.project_id.clone()),
                    ticket.agent_preference.as_str(),
                    opt_text(ticket.lock.as_ref().map(|l| l.run_id.to_string())),
                    opt_int(ticket.lock.as_ref().map(|l| l.lease_expires_at.timestamp_millis())),
                    ticket.version,
                    ticket.reclaim_count as i64,
                    ticket.created_at.to_rfc3339(),
                    ticket.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_ticket: {e}")))?;
        debug!(id = %ticket.id, "Ticket created");
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_ticket: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_ticket row: {e}"))),
        }
    }

    async fn list_tickets(&self, board_id: Uuid) -> Result<Vec<Ticket>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE board_id = ?1 ORDER BY created_at ASC"
                ),
                params![board_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tickets: {e}")))?;
        collect_tickets(rows).await
    }

    async fn find_ticket_by_run(&self, run_id: Uuid) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE lock_run_id = ?1"),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_ticket_by_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_ticket_by_run row: {e}"))),
        }
    }

    async fn count_tickets_in_column(&self, column_id: Uuid) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tickets WHERE column_id = ?1",
                params![column_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tickets_in_column: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_tickets_in_column row: {e}"))),
        }
    }

    async fn move_ticket(
        &self,
        id: Uuid,
        expected_version: i64,
        column_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tickets SET column_id = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4 AND lock_run_id IS NULL",
                params![
                    column_id.to_string(),
                    now.to_rfc3339(),
                    id.to_string(),
                    expected_version
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("move_ticket: {e}")))?;
        Ok(count == 1)
    }

    async fn claim_ticket(&self, claim: &ClaimWrite) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tickets
                 SET column_id = ?1, lock_run_id = ?2, lock_expires_at_ms = ?3,
                     version = version + 1, updated_at = ?4
                 WHERE id = ?5 AND version = ?6
                   AND (lock_run_id IS NULL OR lock_expires_at_ms < ?7)
                   AND (?8 IS NULL OR
                        (SELECT COUNT(*) FROM tickets WHERE column_id = ?1 AND id != ?5) < ?8)",
                params![
                    claim.active_column_id.to_string(),
                    claim.run_id.to_string(),
                    claim.lease_expires_at.timestamp_millis(),
                    claim.now.to_rfc3339(),
                    claim.ticket_id.to_string(),
                    claim.expected_version,
                    claim.now.timestamp_millis(),
                    opt_int(claim.wip_limit.map(i64::from))
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_ticket: {e}")))?;
        Ok(count == 1)
    }

    async fn extend_lease(
        &self,
        run_id: Uuid,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tickets SET lock_expires_at_ms = ?1, version = version + 1, updated_at = ?2
                 WHERE lock_run_id = ?3",
                params![
                    lease_expires_at.timestamp_millis(),
                    now.to_rfc3339(),
                    run_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("extend_lease: {e}")))?;
        Ok(count == 1)
    }

    async fn release_ticket(
        &self,
        ticket_id: Uuid,
        run_id: Uuid,
        column_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tickets
                 SET column_id = ?1, lock_run_id = NULL, lock_expires_at_ms = NULL,
                     reclaim_count = 0, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND lock_run_id = ?4",
                params![
                    column_id.to_string(),
                    now.to_rfc3339(),
                    ticket_id.to_string(),
                    run_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_ticket: {e}")))?;
        Ok(count == 1)
    }

    async fn reclaim_ticket(
        &self,
        ticket_id: Uuid,
        expected_version: i64,
        column_id: Uuid,
        reclaim_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tickets
                 SET column_id = ?1, lock_run_id = NULL, lock_expires_at_ms = NULL,
                     reclaim_count = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND version = ?5 AND lock_run_id IS NOT NULL",
                params![
                    column_id.to_string(),
                    reclaim_count as i64,
                    now.to_rfc3339(),
                    ticket_id.to_string(),
                    expected_version
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_ticket: {e}")))?;
        Ok(count == 1)
    }

    async fn list_expired_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Ticket>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets
                     WHERE lock_run_id IS NOT NULL AND lock_expires_at_ms < ?1
                     ORDER BY lock_expires_at_ms ASC"
                ),
                params![cutoff.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expired_locks: {e}")))?;
        collect_tickets(rows).await
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    run.id.to_string(),
                    run.ticket_id.to_string(),
                    opt_text(run.worker_id.map(|id| id.to_string())),
                    opt_text(run.agent_variant.map(|v| v.as_str().to_string())),
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    opt_text(run.ended_at.map(|d| d.to_rfc3339())),
                    opt_int(run.exit_code.map(i64::from)),
                    opt_text(run.summary.clone()),
                    opt_int(run.lease_duration_ms),
                    opt_text(run.last_heartbeat_at.map(|d| d.to_rfc3339()))
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_run: {e}")))?;
        debug!(id = %run.id, ticket_id = %run.ticket_id, "Run created");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run row: {e}"))),
        }
    }

    async fn list_runs_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<Run>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE ticket_id = ?1 ORDER BY started_at DESC"
                ),
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs_for_ticket: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    async fn record_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE runs SET last_heartbeat_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_heartbeat: {e}")))?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        finalize: &RunFinalize,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE runs SET status = ?1, exit_code = ?2, summary = ?3, ended_at = ?4,
                     lease_duration_ms = NULL
                 WHERE id = ?5 AND status IN ('queued', 'running')",
                params![
                    finalize.status.as_str(),
                    opt_int(finalize.exit_code.map(i64::from)),
                    opt_text(finalize.summary.clone()),
                    ended_at.to_rfc3339(),
                    run_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize_run: {e}")))?;
        Ok(count == 1)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &BoardEvent) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    event.id.to_string(),
                    event.event_type.as_str(),
                    opt_text(event.board_id.map(|id| id.to_string())),
                    opt_text(event.ticket_id.map(|id| id.to_string())),
                    opt_text(event.run_id.map(|id| id.to_string())),
                    payload,
                    event.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        Ok(())
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<BoardEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE (?1 IS NULL OR event_type = ?1)
                       AND (?2 IS NULL OR ticket_id = ?2)
                       AND (?3 IS NULL OR run_id = ?3)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?4"
                ),
                params![
                    opt_text(filter.event_type.map(|t| t.as_str().to_string())),
                    opt_text(filter.ticket_id.map(|id| id.to_string())),
                    opt_text(filter.run_id.map(|id| id.to_string())),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::board::model::WorkflowState;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    /// Board with the six canonical columns; returns (board, columns).
    async fn seeded_board(db: &LibSqlBackend) -> (Board, Vec<Column>) {
        let board = Board::new("Main");
        db.create_board(&board).await.unwrap();
        let mut columns = Vec::new();
        for (i, state) in WorkflowState::ALL.iter().enumerate() {
            let column = Column::new(board.id, state.label(), i as i32);
            db.create_column(&column).await.unwrap();
            columns.push(column);
        }
        (board, columns)
    }

    fn column_id(columns: &[Column], state: WorkflowState) -> Uuid {
        columns.iter().find(|c| c.state() == Some(state)).unwrap().id
    }

    fn claim_for(ticket: &Ticket, active: Uuid, now: DateTime<Utc>) -> ClaimWrite {
        ClaimWrite {
            ticket_id: ticket.id,
            expected_version: ticket.version,
            run_id: Uuid::new_v4(),
            lease_expires_at: now + Duration::seconds(60),
            active_column_id: active,
            wip_limit: None,
            now,
        }
    }

    #[tokio::test]
    async fn board_and_columns_roundtrip() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;

        let fetched = db.get_board(board.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Main");
        let listed = db.list_columns(board.id).await.unwrap();
        assert_eq!(listed.len(), 6);
        assert_eq!(listed[2].name, "In Progress");
        assert_eq!(listed, columns);
        assert!(db.get_board(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ticket_fields_persist() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "Fix CI")
            .with_description("flaky test")
            .with_priority(Priority::Urgent)
            .with_project("infra")
            .with_agent_preference(AgentPreference::VariantB)
            .with_labels(vec!["ci".into(), "bug".into()]);
        db.create_ticket(&ticket).await.unwrap();

        let fetched = db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Fix CI");
        assert_eq!(fetched.description.as_deref(), Some("flaky test"));
        assert_eq!(fetched.priority, Priority::Urgent);
        assert_eq!(fetched.project_id.as_deref(), Some("infra"));
        assert_eq!(fetched.agent_preference, AgentPreference::VariantB);
        assert_eq!(fetched.labels, vec!["ci".to_string(), "bug".to_string()]);
        assert!(fetched.lock.is_none());
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn move_refuses_a_locked_ticket() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let blocked = column_id(&columns, WorkflowState::Blocked);
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let now = Utc::now();
        assert!(db.claim_ticket(&claim_for(&ticket, active, now)).await.unwrap());
        let locked = db.get_ticket(ticket.id).await.unwrap().unwrap();

        assert!(!db.move_ticket(ticket.id, locked.version, blocked, now).await.unwrap());
        let stored = db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.column_id, active);
        assert_eq!(stored.version, locked.version);
    }

    #[tokio::test]
    async fn claim_requires_matching_version() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let now = Utc::now();
        let first = claim_for(&ticket, active, now);
        assert!(db.claim_ticket(&first).await.unwrap());

        // Same observed version, different run: loses.
        let second = claim_for(&ticket, active, now);
        assert!(!db.claim_ticket(&second).await.unwrap());

        let locked = db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(locked.column_id, active);
        assert_eq!(locked.lock.unwrap().run_id, first.run_id);
        assert_eq!(locked.version, 1);
    }

    #[tokio::test]
    async fn claim_refuses_live_lock_but_takes_expired_one() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let now = Utc::now();
        let mut first = claim_for(&ticket, active, now);
        first.lease_expires_at = now + Duration::milliseconds(10);
        assert!(db.claim_ticket(&first).await.unwrap());

        let locked = db.get_ticket(ticket.id).await.unwrap().unwrap();
        let live = claim_for(&locked, active, now);
        assert!(!db.claim_ticket(&live).await.unwrap());

        let later = now + Duration::seconds(1);
        let takeover = claim_for(&locked, active, later);
        assert!(db.claim_ticket(&takeover).await.unwrap());
        let taken = db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(taken.lock.unwrap().run_id, takeover.run_id);
    }

    #[tokio::test]
    async fn claim_enforces_wip_limit_in_statement() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let ready = column_id(&columns, WorkflowState::Ready);

        let busy = Ticket::new(board.id, active, "already running");
        db.create_ticket(&busy).await.unwrap();
        let ticket = Ticket::new(board.id, ready, "waiting");
        db.create_ticket(&ticket).await.unwrap();

        let mut claim = claim_for(&ticket, active, Utc::now());
        claim.wip_limit = Some(1);
        assert!(!db.claim_ticket(&claim).await.unwrap());

        claim.wip_limit = Some(2);
        assert!(db.claim_ticket(&claim).await.unwrap());
        assert_eq!(db.count_tickets_in_column(active).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn extend_release_and_reclaim_are_owner_guarded() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let review = column_id(&columns, WorkflowState::Review);
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let now = Utc::now();
        let claim = claim_for(&ticket, active, now);
        assert!(db.claim_ticket(&claim).await.unwrap());

        assert!(!db.extend_lease(Uuid::new_v4(), now, now).await.unwrap());
        let new_expiry = now + Duration::seconds(120);
        assert!(db.extend_lease(claim.run_id, new_expiry, now).await.unwrap());
        let found = db.find_ticket_by_run(claim.run_id).await.unwrap().unwrap();
        assert_eq!(
            found.lock.as_ref().unwrap().lease_expires_at.timestamp_millis(),
            new_expiry.timestamp_millis()
        );

        // Stale version from before the heartbeat cannot reclaim.
        assert!(!db.reclaim_ticket(ticket.id, 1, review, 1, now).await.unwrap());

        assert!(!db.release_ticket(ticket.id, Uuid::new_v4(), review, now).await.unwrap());
        assert!(db.release_ticket(ticket.id, claim.run_id, review, now).await.unwrap());
        let released = db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert!(released.lock.is_none());
        assert_eq!(released.column_id, review);
        assert!(db.find_ticket_by_run(claim.run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_locks_are_listed_by_cutoff() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let active = column_id(&columns, WorkflowState::InProgress);
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let now = Utc::now();
        let claim = claim_for(&ticket, active, now);
        db.claim_ticket(&claim).await.unwrap();

        assert!(db.list_expired_locks(now).await.unwrap().is_empty());
        let expired = db
            .list_expired_locks(now + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, ticket.id);
    }

    #[tokio::test]
    async fn finalize_run_only_once() {
        let db = test_db().await;
        let (board, columns) = seeded_board(&db).await;
        let ticket = Ticket::new(board.id, column_id(&columns, WorkflowState::Ready), "t");
        db.create_ticket(&ticket).await.unwrap();

        let run = Run {
            id: Uuid::new_v4(),
            ticket_id: ticket.id,
            worker_id: None,
            agent_variant: Some(AgentVariant::VariantA),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            summary: None,
            lease_duration_ms: Some(60_000),
            last_heartbeat_at: None,
        };
        db.insert_run(&run).await.unwrap();

        let done = RunFinalize::finished(Some(0), "all good");
        assert!(db.finalize_run(run.id, &done, Utc::now()).await.unwrap());
        assert!(!db.finalize_run(run.id, &RunFinalize::error(Some(1), "late"), Utc::now()).await.unwrap());

        let fetched = db.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Finished);
        assert_eq!(fetched.exit_code, Some(0));
        assert_eq!(fetched.summary.as_deref(), Some("all good"));
        assert!(fetched.ended_at.is_some());
        assert!(fetched.lease_duration_ms.is_none());
        assert_eq!(db.list_runs_for_ticket(ticket.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_filter_and_order() {
        let db = test_db().await;
        let ticket = Ticket::new(Uuid::new_v4(), Uuid::new_v4(), "t");
        let run_id = Uuid::new_v4();

        let first = BoardEvent::new(EventType::RunStarted)
            .for_ticket(&ticket)
            .with_run(run_id)
            .with_payload(serde_json::json!({"lease_ms": 1000}));
        let second = BoardEvent::new(EventType::RunFinished)
            .for_ticket(&ticket)
            .with_run(run_id);
        let unrelated = BoardEvent::new(EventType::WorkerStarted);
        for event in [&first, &second, &unrelated] {
            db.append_event(event).await.unwrap();
        }

        let all = db.list_events(&EventFilter::default(), 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, unrelated.id);

        let by_run = EventFilter {
            run_id: Some(run_id),
            ..Default::default()
        };
        let runs = db.list_events(&by_run, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].payload["lease_ms"], 1000);

        let by_type = EventFilter {
            event_type: Some(EventType::RunFinished),
            ..Default::default()
        };
        assert_eq!(db.list_events(&by_type, 10).await.unwrap()[0].id, second.id);
        assert_eq!(db.list_events(&EventFilter::default(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_database_file_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("board.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.create_board(&Board::new("disk")).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.list_boards().await.unwrap().len(), 1);
    }
}
