//! SQLite persistence layer.
//!
//! Three collections: triangles, events (append-only audit log) and
//! accounts. The store is an explicit value with a lifecycle; the single
//! connection runs in WAL mode and every multi-record mutation happens in
//! one IMMEDIATE transaction. The `UNIQUE(account, nonce)` index on events
//! is the authoritative replay guard: concurrent duplicates resolve to
//! exactly one inserted row and one constraint violation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::geometry::GeoPoint;
use crate::mesh::{TriangleId, FACE_COUNT, MAX_LEVEL};
use crate::proof::{format_timestamp, parse_timestamp};
use crate::reward::format_step;

/// Click count at which a triangle subdivides and retires.
pub const SUBDIVISION_CLICKS: u32 = 11;
/// Account recorded on subdivide events; never a real miner address.
pub const SYSTEM_ACCOUNT: &str = "system";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("nonce already recorded for this account")]
    DuplicateNonce,
    #[error("triangle {0} is retired and accepts no further clicks")]
    TriangleRetired(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("stored data is unreadable: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriangleState {
    Active,
    Subdivided,
}

impl TriangleState {
    fn as_str(&self) -> &'static str {
        match self {
            TriangleState::Active => "active",
            TriangleState::Subdivided => "subdivided",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(TriangleState::Active),
            "subdivided" => Ok(TriangleState::Subdivided),
            other => Err(StoreError::Corrupt(format!("unknown triangle state '{other}'"))),
        }
    }
}

/// Materialized triangle row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriangleRecord {
    pub id: TriangleId,
    pub face: u8,
    pub level: u8,
    pub path: String,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub state: TriangleState,
    pub clicks: u32,
    pub moratorium_start_at: DateTime<Utc>,
    pub last_click_at: Option<DateTime<Utc>>,
    pub centroid: GeoPoint,
    pub polygon: Vec<GeoPoint>,
}

impl TriangleRecord {
    /// A fresh active record for a mesh cell, geometry derived from the
    /// algebra.
    pub fn new_active(id: TriangleId, now: DateTime<Utc>) -> Self {
        let centroid = id.centroid();
        let polygon = id.polygon();
        let parent_id = id.parent().ok().map(|p| p.to_string());
        TriangleRecord {
            face: id.face(),
            level: id.level(),
            path: id.path_string(),
            parent_id,
            children: Vec::new(),
            state: TriangleState::Active,
            clicks: 0,
            moratorium_start_at: now,
            last_click_at: None,
            centroid,
            polygon,
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Click,
    Subdivide,
}

impl EventKind {
    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "click" => Ok(EventKind::Click),
            "subdivide" => Ok(EventKind::Subdivide),
            other => Err(StoreError::Corrupt(format!("unknown event kind '{other}'"))),
        }
    }
}

/// One audit-log row; inserted exactly once, never mutated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub triangle_id: String,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub account: String,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub payload: serde_json::Value,
}

/// Everything the atomic commit needs for one accepted click.
#[derive(Debug)]
pub struct ClickCommit<'a> {
    pub triangle_id: &'a TriangleId,
    pub account: &'a str,
    pub nonce: &'a str,
    pub signature_hex: &'a str,
    pub reward_micro: u64,
    pub received_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f64,
    /// Client-reported capture time; the next proof's speed gate reads it
    /// back from the event payload.
    pub client_timestamp: DateTime<Utc>,
    pub speed_mps: Option<f64>,
}

/// Result of a committed click.
#[derive(Debug, Clone)]
pub struct ClickOutcome {
    pub event_id: String,
    pub clicks: u32,
    pub balance_micro: u64,
    /// Child ids when this click triggered subdivision.
    pub children: Option<[TriangleId; 4]>,
}

/// Per-level aggregate for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelStats {
    pub level: u8,
    pub triangles: u64,
    pub active: u64,
    pub subdivided: u64,
    pub clicks: u64,
}

/// Health snapshot for `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub status: &'static str,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub info: serde_json::Value,
}

/// The storage engine owner. All mutation goes through here.
pub struct Store {
    conn: Mutex<Connection>,
    path: String,
    connected_at: DateTime<Utc>,
    last_error: RwLock<Option<(DateTime<Utc>, String)>>,
}

impl Store {
    /// Opens (creating if needed) the database and ensures the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            path: path.to_string(),
            connected_at: Utc::now(),
            last_error: RwLock::new(None),
        })
    }

    /// Throwaway in-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Explicit close; dropping the store closes the connection anyway.
    pub fn close(self) {
        drop(self.conn.into_inner());
    }

    fn note_error(&self, err: &StoreError) {
        // Replay conflicts are normal traffic, not store failures.
        if matches!(err, StoreError::DuplicateNonce | StoreError::TriangleRetired(_)) {
            return;
        }
        *self.last_error.write() = Some((Utc::now(), err.to_string()));
    }

    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &result {
            self.note_error(err);
        }
        result
    }

    // ------------------------------------------------------------------
    // Seeding and lookups
    // ------------------------------------------------------------------

    /// Inserts the 20 level-1 face triangles if absent. Returns how many
    /// rows were created.
    pub fn ensure_face_triangles(&self) -> Result<usize, StoreError> {
        let result = (|| {
            let now = Utc::now();
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut created = 0;
            for face in 0..FACE_COUNT {
                let id = TriangleId::face_root(face)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let exists: bool = tx
                    .query_row(
                        "SELECT 1 FROM triangles WHERE id = ?1",
                        params![id.to_string()],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                if !exists {
                    insert_triangle(&tx, &TriangleRecord::new_active(id, now))?;
                    created += 1;
                }
            }
            tx.commit()?;
            Ok(created)
        })();
        self.track(result)
    }

    /// Materializes one triangle record. Normal operation only creates
    /// cells through seeding and subdivision; this is the backfill path.
    pub fn insert_triangle_record(&self, record: &TriangleRecord) -> Result<(), StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            insert_triangle(&conn, record)
        })();
        self.track(result)
    }

    /// Fetches a triangle by id.
    pub fn triangle(&self, id: &TriangleId) -> Result<Option<TriangleRecord>, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            read_triangle(&conn, &id.to_string())
        })();
        self.track(result)
    }

    /// Whether `(account, nonce)` was already recorded. An optimization
    /// only; the unique index is the real guard.
    pub fn has_nonce(&self, account: &str, nonce: &str) -> Result<bool, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let row: Option<bool> = conn
                .query_row(
                    "SELECT 1 FROM events WHERE account = ?1 AND nonce = ?2",
                    params![account, nonce],
                    |_| Ok(true),
                )
                .optional()?;
            Ok(row.unwrap_or(false))
        })();
        self.track(result)
    }

    /// The account's most recent click event, if any.
    pub fn latest_click(&self, account: &str) -> Result<Option<EventRecord>, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let row = conn
                .query_row(
                    "SELECT id, triangle_id, kind, at, account, nonce, signature, payload
                     FROM events
                     WHERE account = ?1 AND kind = 'click'
                     ORDER BY at DESC
                     LIMIT 1",
                    params![account],
                    row_to_event,
                )
                .optional()?;
            row.transpose()
        })();
        self.track(result)
    }

    /// Current balance in micro-STEP; zero when the account was never
    /// credited.
    pub fn account_balance_micro(&self, address: &str) -> Result<u64, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let balance: Option<i64> = conn
                .query_row(
                    "SELECT balance FROM accounts WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(balance.unwrap_or(0) as u64)
        })();
        self.track(result)
    }

    /// Number of events for a `(account, nonce)` pair; test/audit helper.
    pub fn event_count(&self, account: &str, nonce: &str) -> Result<u64, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM events WHERE account = ?1 AND nonce = ?2",
                params![account, nonce],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })();
        self.track(result)
    }

    /// Subdivide events recorded against a parent triangle.
    pub fn subdivide_events(&self, triangle_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, triangle_id, kind, at, account, nonce, signature, payload
                 FROM events
                 WHERE triangle_id = ?1 AND kind = 'subdivide'
                 ORDER BY at DESC",
            )?;
            let rows = stmt.query_map(params![triangle_id], row_to_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row??);
            }
            Ok(events)
        })();
        self.track(result)
    }

    /// Per-level aggregates over materialized triangles.
    pub fn stats(&self, level: Option<u8>) -> Result<Vec<LevelStats>, StoreError> {
        let result = (|| {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT level,
                        COUNT(*),
                        SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN state = 'subdivided' THEN 1 ELSE 0 END),
                        SUM(clicks)
                 FROM triangles
                 WHERE (?1 IS NULL OR level = ?1)
                 GROUP BY level
                 ORDER BY level",
            )?;
            let rows = stmt.query_map(params![level], |row| {
                Ok(LevelStats {
                    level: row.get::<_, i64>(0)? as u8,
                    triangles: row.get::<_, i64>(1)? as u64,
                    active: row.get::<_, i64>(2)? as u64,
                    subdivided: row.get::<_, i64>(3)? as u64,
                    clicks: row.get::<_, i64>(4)? as u64,
                })
            })?;
            let mut stats = Vec::new();
            for row in rows {
                stats.push(row?);
            }
            Ok(stats)
        })();
        self.track(result)
    }

    // ------------------------------------------------------------------
    // The atomic click commit
    // ------------------------------------------------------------------

    /// Commits one accepted proof: the click event, the triangle click
    /// count (with subdivision exactly at the threshold) and the account
    /// credit — all in one transaction, or none of it.
    pub fn commit_click(&self, commit: &ClickCommit<'_>) -> Result<ClickOutcome, StoreError> {
        let result = self.commit_click_inner(commit);
        self.track(result)
    }

    fn commit_click_inner(&self, commit: &ClickCommit<'_>) -> Result<ClickOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id_str = commit.triangle_id.to_string();
        let current = read_triangle(&tx, &id_str)?
            .ok_or_else(|| StoreError::Corrupt(format!("triangle {id_str} vanished mid-commit")))?;
        if current.state != TriangleState::Active || current.clicks >= SUBDIVISION_CLICKS {
            return Err(StoreError::TriangleRetired(id_str));
        }

        let new_clicks = current.clicks + 1;
        let event_id = Uuid::new_v4().to_string();
        let at = format_timestamp(&commit.received_at);

        let mut payload = serde_json::json!({
            "miner": commit.account,
            "reward": format_step(commit.reward_micro),
            "rewardMicro": commit.reward_micro,
            "clickNumber": new_clicks,
            "lat": commit.lat,
            "lon": commit.lon,
            "accuracy": commit.accuracy_m,
            "clientTimestamp": format_timestamp(&commit.client_timestamp),
        });
        if let Some(speed) = commit.speed_mps {
            payload["speedMps"] = serde_json::json!(speed);
        }

        tx.execute(
            "INSERT INTO events (id, triangle_id, kind, at, account, nonce, signature, payload)
             VALUES (?1, ?2, 'click', ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id,
                id_str,
                at,
                commit.account,
                commit.nonce,
                commit.signature_hex,
                payload.to_string(),
            ],
        )
        .map_err(map_nonce_conflict)?;

        let children = if new_clicks == SUBDIVISION_CLICKS && current.level < MAX_LEVEL {
            let children = commit
                .triangle_id
                .children()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            for child in &children {
                insert_triangle(
                    &tx,
                    &TriangleRecord::new_active(child.clone(), commit.received_at),
                )?;
            }
            let child_ids: Vec<String> = children.iter().map(|c| c.to_string()).collect();
            tx.execute(
                "UPDATE triangles
                 SET clicks = ?2, state = 'subdivided', children = ?3, last_click_at = ?4
                 WHERE id = ?1",
                params![id_str, new_clicks, serde_json::to_string(&child_ids).unwrap_or_default(), at],
            )?;

            let subdivide_id = Uuid::new_v4().to_string();
            let subdivide_payload = serde_json::json!({
                "parentId": id_str,
                "childIds": child_ids,
                "oldLevel": current.level,
                "newLevel": current.level + 1,
            });
            // (account='system', nonce=event-id) keeps the unique index happy.
            tx.execute(
                "INSERT INTO events (id, triangle_id, kind, at, account, nonce, signature, payload)
                 VALUES (?1, ?2, 'subdivide', ?3, ?4, ?5, NULL, ?6)",
                params![
                    subdivide_id,
                    id_str,
                    at,
                    SYSTEM_ACCOUNT,
                    subdivide_id,
                    subdivide_payload.to_string(),
                ],
            )?;
            Some(children)
        } else {
            // Level-21 leaves saturate at the click threshold and simply
            // retire; there is nothing left to subdivide into.
            let state = if new_clicks == SUBDIVISION_CLICKS {
                "subdivided"
            } else {
                "active"
            };
            tx.execute(
                "UPDATE triangles SET clicks = ?2, state = ?3, last_click_at = ?4 WHERE id = ?1",
                params![id_str, new_clicks, state, at],
            )?;
            None
        };

        tx.execute(
            "INSERT INTO accounts (address, balance) VALUES (?1, ?2)
             ON CONFLICT(address) DO UPDATE SET balance = balance + excluded.balance",
            params![commit.account, commit.reward_micro as i64],
        )?;
        let balance: i64 = tx.query_row(
            "SELECT balance FROM accounts WHERE address = ?1",
            params![commit.account],
            |row| row.get(0),
        )?;

        tx.commit()?;

        Ok(ClickOutcome {
            event_id,
            clicks: new_clicks,
            balance_micro: balance as u64,
            children,
        })
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn health(&self) -> StoreHealth {
        let (status, info) = match self.collect_info() {
            Ok(info) => ("ok", info),
            Err(e) => {
                self.note_error(&e);
                ("error", serde_json::json!({ "message": e.to_string() }))
            }
        };
        let last = self.last_error.read().clone();
        StoreHealth {
            status,
            connected_at: self.connected_at,
            last_error_at: last.as_ref().map(|(at, _)| *at),
            last_error: last.map(|(_, msg)| msg),
            info,
        }
    }

    fn collect_info(&self) -> Result<serde_json::Value, StoreError> {
        let conn = self.conn.lock();
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok(serde_json::json!({
            "path": self.path,
            "triangles": count("triangles")?,
            "events": count("events")?,
            "accounts": count("accounts")?,
        }))
    }
}

// ----------------------------------------------------------------------------
// Schema and row mapping
// ----------------------------------------------------------------------------

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS triangles (
             id                  TEXT PRIMARY KEY,
             face                INTEGER NOT NULL,
             level               INTEGER NOT NULL,
             path                TEXT NOT NULL,
             parent_id           TEXT,
             children            TEXT NOT NULL DEFAULT '[]',
             state               TEXT NOT NULL DEFAULT 'active',
             clicks              INTEGER NOT NULL DEFAULT 0,
             moratorium_start_at TEXT NOT NULL,
             last_click_at       TEXT,
             centroid_lat        REAL NOT NULL,
             centroid_lon        REAL NOT NULL,
             polygon             TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_triangles_state_level
             ON triangles (state, level);
         CREATE INDEX IF NOT EXISTS idx_triangles_centroid
             ON triangles (centroid_lat, centroid_lon);

         CREATE TABLE IF NOT EXISTS events (
             id          TEXT PRIMARY KEY,
             triangle_id TEXT NOT NULL,
             kind        TEXT NOT NULL,
             at          TEXT NOT NULL,
             account     TEXT NOT NULL,
             nonce       TEXT NOT NULL,
             signature   TEXT,
             payload     TEXT NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_events_account_nonce
             ON events (account, nonce);
         CREATE INDEX IF NOT EXISTS idx_events_account_at
             ON events (account, at DESC);
         CREATE INDEX IF NOT EXISTS idx_events_triangle_at
             ON events (triangle_id, at DESC);

         CREATE TABLE IF NOT EXISTS accounts (
             address TEXT PRIMARY KEY,
             balance INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_accounts_balance
             ON accounts (balance DESC);",
    )?;
    Ok(())
}

fn insert_triangle(conn: &Connection, record: &TriangleRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO triangles
             (id, face, level, path, parent_id, children, state, clicks,
              moratorium_start_at, last_click_at, centroid_lat, centroid_lon, polygon)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            record.id.to_string(),
            record.face,
            record.level,
            record.path,
            record.parent_id,
            serde_json::to_string(&record.children)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            record.state.as_str(),
            record.clicks,
            format_timestamp(&record.moratorium_start_at),
            record.last_click_at.map(|ts| format_timestamp(&ts)),
            record.centroid.lat,
            record.centroid.lon,
            serde_json::to_string(&record.polygon)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ],
    )?;
    Ok(())
}

fn read_triangle(conn: &Connection, id: &str) -> Result<Option<TriangleRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, face, level, path, parent_id, children, state, clicks,
                    moratorium_start_at, last_click_at, centroid_lat, centroid_lon, polygon
             FROM triangles WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, f64>(10)?,
                    row.get::<_, f64>(11)?,
                    row.get::<_, String>(12)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id_str,
        face,
        level,
        path,
        parent_id,
        children_json,
        state,
        clicks,
        moratorium_at,
        last_click_at,
        centroid_lat,
        centroid_lon,
        polygon_json,
    )) = row
    else {
        return Ok(None);
    };

    let id = TriangleId::decode(&id_str).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Some(TriangleRecord {
        id,
        face: face as u8,
        level: level as u8,
        path,
        parent_id,
        children: serde_json::from_str(&children_json)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        state: TriangleState::parse(&state)?,
        clicks: clicks as u32,
        moratorium_start_at: parse_stored_timestamp(&moratorium_at)?,
        last_click_at: last_click_at
            .as_deref()
            .map(parse_stored_timestamp)
            .transpose()?,
        centroid: GeoPoint::new(centroid_lat, centroid_lon),
        polygon: serde_json::from_str(&polygon_json)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
    }))
}

type EventTuple = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
);

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Result<EventRecord, StoreError>, rusqlite::Error> {
    let tuple: EventTuple = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    );
    Ok(build_event(tuple))
}

fn build_event(tuple: EventTuple) -> Result<EventRecord, StoreError> {
    let (id, triangle_id, kind, at, account, nonce, signature, payload) = tuple;
    Ok(EventRecord {
        id,
        triangle_id,
        kind: EventKind::parse(&kind)?,
        at: parse_stored_timestamp(&at)?,
        account,
        nonce,
        signature,
        payload: serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt(e.to_string()))?,
    })
}

fn parse_stored_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(s).map_err(|_| StoreError::Corrupt(format!("bad stored timestamp '{s}'")))
}

/// Maps the UNIQUE(account, nonce) violation to the replay error; anything
/// else passes through.
fn map_nonce_conflict(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(inner, Some(msg)) = &err {
        if inner.code == ErrorCode::ConstraintViolation
            && msg.contains("events.account")
            && msg.contains("events.nonce")
        {
            return StoreError::DuplicateNonce;
        }
    }
    StoreError::Database(err)
}
