mod error;
mod models;

pub use error::{DbError, Result};
pub use models::{
  FinishedSession, KillRecord, PingAggregate, PlayerInfo, PlayerKill, PlayerName, RemovedRows,
  ServerInfo, ServerOverview, TpsRecord, WorldTimes,
};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Params, Row, Transaction, params, types::Type};
use tracing::{debug, info};
use uuid::Uuid;

/// Storage gateway for all Lookout operations.
///
/// Cloning is cheap; all clones share one connection and one open/closed flag.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
  open: Arc<AtomicBool>,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self {
      conn,
      open: Arc::new(AtomicBool::new(true)),
    };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self {
      conn,
      open: Arc::new(AtomicBool::new(true)),
    };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self.conn
            .call(|conn| {
                // WAL keeps dashboard reads from blocking session writes
                conn.pragma_update(None, "journal_mode", "WAL")?;

                // Enable foreign key constraints (must be set per-connection)
                conn.pragma_update(None, "foreign_keys", "ON")?;

                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS servers (
                        uuid TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        registered_at INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS players (
                        uuid TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        registered_at INTEGER NOT NULL,
                        last_address TEXT
                    );

                    CREATE TABLE IF NOT EXISTS sessions (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        player_uuid TEXT NOT NULL REFERENCES players(uuid) ON DELETE CASCADE,
                        server_uuid TEXT NOT NULL REFERENCES servers(uuid) ON DELETE CASCADE,
                        session_start INTEGER NOT NULL,
                        session_end INTEGER NOT NULL,
                        afk_time INTEGER NOT NULL,
                        deaths INTEGER NOT NULL,
                        mob_kills INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS world_times (
                        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                        world_name TEXT NOT NULL,
                        game_mode TEXT NOT NULL,
                        millis INTEGER NOT NULL,
                        PRIMARY KEY (session_id, world_name, game_mode)
                    );

                    CREATE TABLE IF NOT EXISTS kills (
                        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                        killer_uuid TEXT NOT NULL,
                        victim_uuid TEXT NOT NULL,
                        server_uuid TEXT NOT NULL,
                        weapon TEXT NOT NULL,
                        date INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ping (
                        player_uuid TEXT NOT NULL REFERENCES players(uuid) ON DELETE CASCADE,
                        server_uuid TEXT NOT NULL REFERENCES servers(uuid) ON DELETE CASCADE,
                        date INTEGER NOT NULL,
                        min_ping INTEGER NOT NULL,
                        max_ping INTEGER NOT NULL,
                        avg_ping REAL NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tps (
                        server_uuid TEXT NOT NULL REFERENCES servers(uuid) ON DELETE CASCADE,
                        date INTEGER NOT NULL,
                        tps REAL NOT NULL,
                        players_online INTEGER NOT NULL,
                        cpu_usage REAL NOT NULL,
                        ram_usage INTEGER NOT NULL,
                        entities INTEGER NOT NULL,
                        chunks_loaded INTEGER NOT NULL,
                        free_disk_space INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_server ON sessions(server_uuid, session_start);
                    CREATE INDEX IF NOT EXISTS idx_sessions_player ON sessions(player_uuid);
                    CREATE INDEX IF NOT EXISTS idx_kills_server ON kills(server_uuid);
                    CREATE INDEX IF NOT EXISTS idx_ping_server_date ON ping(server_uuid, date);
                    CREATE INDEX IF NOT EXISTS idx_tps_server_date ON tps(server_uuid, date);
                    "#,
                )?;
                Ok(())
            })
            .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Gateway
  // ========================================================================

  /// Whether the gateway still accepts work.
  pub fn is_open(&self) -> bool {
    self.open.load(Ordering::Acquire)
  }

  /// Stop accepting work. Calls made afterwards fail with [`DbError::Closed`].
  pub fn close(&self) {
    if self.open.swap(false, Ordering::AcqRel) {
      info!("database closed");
    }
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_open() {
      Ok(())
    } else {
      Err(DbError::Closed)
    }
  }

  /// Run a unit of work inside a single transaction.
  /// Either everything the closure wrote is committed or nothing is.
  pub async fn execute<F, R>(&self, work: F) -> Result<R>
  where
    F: FnOnce(&Transaction<'_>) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
  {
    self.ensure_open()?;
    let value = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
      })
      .await?;

    Ok(value)
  }

  /// Run a read against the connection and return its typed result.
  pub async fn query<F, R>(&self, read: F) -> Result<R>
  where
    F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
  {
    self.ensure_open()?;
    let value = self
      .conn
      .call(move |conn| {
        let value = read(conn)?;
        Ok(value)
      })
      .await?;

    Ok(value)
  }

  // ========================================================================
  // Servers
  // ========================================================================

  /// Register a server, or rename it if it is already known.
  pub async fn register_server(&self, uuid: Uuid, name: String, now: i64) -> Result<ServerInfo> {
    let server = self
      .execute(move |tx| {
        tx.prepare_cached(
          "INSERT INTO servers (uuid, name, registered_at) VALUES (?1, ?2, ?3)
           ON CONFLICT(uuid) DO UPDATE SET name = excluded.name",
        )?
        .execute(params![uuid.to_string(), &name, now])?;

        tx.prepare_cached("SELECT uuid, name, registered_at FROM servers WHERE uuid = ?1")?
          .query_row(params![uuid.to_string()], server_row)
      })
      .await?;

    debug!(server = %server.uuid, name = %server.name, "registered server");
    Ok(server)
  }

  pub async fn server_exists(&self, uuid: Uuid) -> Result<bool> {
    self
      .query(move |conn| {
        conn
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM servers WHERE uuid = ?1)")?
          .query_row(params![uuid.to_string()], |row| row.get(0))
      })
      .await
  }

  pub async fn get_servers(&self) -> Result<Vec<ServerInfo>> {
    self
      .query(|conn| {
        conn
          .prepare_cached("SELECT uuid, name, registered_at FROM servers ORDER BY name")?
          .query_map([], server_row)?
          .collect()
      })
      .await
  }

  // ========================================================================
  // Players
  // ========================================================================

  /// Register a player joining `server`, updating name and address if already known.
  /// Returns true when the player was seen for the first time.
  pub async fn register_player(
    &self,
    uuid: Uuid,
    name: PlayerName,
    address: Option<String>,
    server: Uuid,
    now: i64,
  ) -> Result<bool> {
    let created = self
      .execute(move |tx| {
        let server_known: bool = tx
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM servers WHERE uuid = ?1)")?
          .query_row(params![server.to_string()], |row| row.get(0))?;
        if !server_known {
          return Ok(Err(DbError::ServerNotFound));
        }

        let existed: bool = tx
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM players WHERE uuid = ?1)")?
          .query_row(params![uuid.to_string()], |row| row.get(0))?;

        tx.prepare_cached(
          "INSERT INTO players (uuid, name, registered_at, last_address) VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(uuid) DO UPDATE SET
             name = excluded.name,
             last_address = COALESCE(excluded.last_address, players.last_address)",
        )?
        .execute(params![uuid.to_string(), name.as_str(), now, &address])?;

        Ok(Ok(!existed))
      })
      .await??;

    debug!(player = %uuid, %name, created, "registered player");
    Ok(created)
  }

  pub async fn get_player(&self, uuid: Uuid) -> Result<Option<PlayerInfo>> {
    self
      .query(move |conn| {
        conn
          .prepare_cached(
            "SELECT uuid, name, registered_at, last_address FROM players WHERE uuid = ?1",
          )?
          .query_row(params![uuid.to_string()], player_row)
          .optional()
      })
      .await
  }

  pub async fn get_players(&self) -> Result<Vec<PlayerInfo>> {
    self
      .query(|conn| {
        conn
          .prepare_cached(
            "SELECT uuid, name, registered_at, last_address FROM players ORDER BY name",
          )?
          .query_map([], player_row)?
          .collect()
      })
      .await
  }

  // ========================================================================
  // Sessions
  // ========================================================================

  /// Store a finished session with its world times and kills in one transaction.
  pub async fn store_session(&self, session: FinishedSession) -> Result<i64> {
    let player = session.player;
    let id = self.execute(move |tx| insert_session(tx, &session)).await?;

    debug!(%player, session_id = id, "stored session");
    Ok(id)
  }

  /// Most recent sessions, optionally limited to one server.
  pub async fn get_sessions(&self, server: Option<Uuid>, limit: usize) -> Result<Vec<FinishedSession>> {
    let limit = limit as i64;
    self
      .query(move |conn| match server {
        Some(server) => read_sessions(
          conn,
          "SELECT id, player_uuid, server_uuid, session_start, session_end, afk_time, deaths, mob_kills
           FROM sessions WHERE server_uuid = ?1 ORDER BY session_start DESC LIMIT ?2",
          params![server.to_string(), limit],
        ),
        None => read_sessions(
          conn,
          "SELECT id, player_uuid, server_uuid, session_start, session_end, afk_time, deaths, mob_kills
           FROM sessions ORDER BY session_start DESC LIMIT ?1",
          params![limit],
        ),
      })
      .await
  }

  pub async fn get_player_sessions(&self, player: Uuid) -> Result<Vec<FinishedSession>> {
    self
      .query(move |conn| {
        read_sessions(
          conn,
          "SELECT id, player_uuid, server_uuid, session_start, session_end, afk_time, deaths, mob_kills
           FROM sessions WHERE player_uuid = ?1 ORDER BY session_start DESC",
          params![player.to_string()],
        )
      })
      .await
  }

  /// Player kills, newest first, optionally limited to one server.
  pub async fn get_player_kills(&self, server: Option<Uuid>) -> Result<Vec<KillRecord>> {
    self
      .query(move |conn| match server {
        Some(server) => conn
          .prepare_cached(
            "SELECT killer_uuid, server_uuid, victim_uuid, weapon, date FROM kills
             WHERE server_uuid = ?1 ORDER BY date DESC",
          )?
          .query_map(params![server.to_string()], kill_row)?
          .collect(),
        None => conn
          .prepare_cached(
            "SELECT killer_uuid, server_uuid, victim_uuid, weapon, date FROM kills ORDER BY date DESC",
          )?
          .query_map([], kill_row)?
          .collect(),
      })
      .await
  }

  // ========================================================================
  // Ping & Performance
  // ========================================================================

  /// Store flushed ping windows. All rows commit together.
  pub async fn store_ping_aggregates(&self, aggregates: Vec<PingAggregate>) -> Result<usize> {
    let count = self
      .execute(move |tx| {
        let mut stmt = tx.prepare_cached(
          "INSERT INTO ping (player_uuid, server_uuid, date, min_ping, max_ping, avg_ping)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for ping in &aggregates {
          stmt.execute(params![
            ping.player.to_string(),
            ping.server.to_string(),
            ping.date,
            ping.min,
            ping.max,
            ping.avg
          ])?;
        }
        Ok(aggregates.len())
      })
      .await?;

    debug!(count, "stored ping aggregates");
    Ok(count)
  }

  /// Store flushed performance windows. All rows commit together.
  pub async fn store_tps_records(&self, records: Vec<TpsRecord>) -> Result<usize> {
    let count = self
      .execute(move |tx| {
        let mut stmt = tx.prepare_cached(
          "INSERT INTO tps (server_uuid, date, tps, players_online, cpu_usage, ram_usage, entities, chunks_loaded, free_disk_space)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for record in &records {
          stmt.execute(params![
            record.server.to_string(),
            record.date,
            record.tps,
            record.players_online,
            record.cpu_usage,
            record.ram_usage,
            record.entities,
            record.chunks_loaded,
            record.free_disk_space
          ])?;
        }
        Ok(records.len())
      })
      .await?;

    debug!(count, "stored tps records");
    Ok(count)
  }

  /// Ping windows for a server stored at or after `after`, oldest first.
  pub async fn get_ping_series(&self, server: Uuid, after: i64) -> Result<Vec<PingAggregate>> {
    self
      .query(move |conn| {
        conn
          .prepare_cached(
            "SELECT date, player_uuid, server_uuid, min_ping, max_ping, avg_ping FROM ping
             WHERE server_uuid = ?1 AND date >= ?2 ORDER BY date",
          )?
          .query_map(params![server.to_string(), after], |row| {
            Ok(PingAggregate {
              date: row.get(0)?,
              player: uuid_column(row, 1)?,
              server: uuid_column(row, 2)?,
              min: row.get(3)?,
              max: row.get(4)?,
              avg: row.get(5)?,
            })
          })?
          .collect()
      })
      .await
  }

  /// Performance windows for a server stored at or after `after`, oldest first.
  pub async fn get_tps_series(&self, server: Uuid, after: i64) -> Result<Vec<TpsRecord>> {
    self
      .query(move |conn| {
        conn
          .prepare_cached(
            "SELECT date, server_uuid, tps, players_online, cpu_usage, ram_usage, entities, chunks_loaded, free_disk_space
             FROM tps WHERE server_uuid = ?1 AND date >= ?2 ORDER BY date",
          )?
          .query_map(params![server.to_string(), after], |row| {
            Ok(TpsRecord {
              date: row.get(0)?,
              server: uuid_column(row, 1)?,
              tps: row.get(2)?,
              players_online: row.get(3)?,
              cpu_usage: row.get(4)?,
              ram_usage: row.get(5)?,
              entities: row.get(6)?,
              chunks_loaded: row.get(7)?,
              free_disk_space: row.get(8)?,
            })
          })?
          .collect()
      })
      .await
  }

  /// Totals for one server across everything stored.
  pub async fn get_server_overview(&self, server: Uuid) -> Result<ServerOverview> {
    let overview = self
      .query(move |conn| {
        let key = server.to_string();
        let exists: bool = conn
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM servers WHERE uuid = ?1)")?
          .query_row(params![&key], |row| row.get(0))?;
        if !exists {
          return Ok(Err(DbError::ServerNotFound));
        }

        let (sessions, unique_players, playtime, afk_time, deaths, mob_kills): (i64, i64, i64, i64, i64, i64) = conn
          .prepare_cached(
            "SELECT COUNT(*), COUNT(DISTINCT player_uuid),
                    COALESCE(SUM(session_end - session_start), 0), COALESCE(SUM(afk_time), 0),
                    COALESCE(SUM(deaths), 0), COALESCE(SUM(mob_kills), 0)
             FROM sessions WHERE server_uuid = ?1",
          )?
          .query_row(params![&key], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
          })?;

        let player_kills: i64 = conn
          .prepare_cached("SELECT COUNT(*) FROM kills WHERE server_uuid = ?1")?
          .query_row(params![&key], |row| row.get(0))?;

        let avg_ping: Option<f64> = conn
          .prepare_cached("SELECT AVG(avg_ping) FROM ping WHERE server_uuid = ?1")?
          .query_row(params![&key], |row| row.get(0))?;

        let latest_tps: Option<f64> = conn
          .prepare_cached("SELECT tps FROM tps WHERE server_uuid = ?1 ORDER BY date DESC LIMIT 1")?
          .query_row(params![&key], |row| row.get(0))
          .optional()?;

        Ok(Ok(ServerOverview {
          server,
          sessions: sessions as u64,
          unique_players: unique_players as u64,
          playtime,
          afk_time,
          deaths: deaths as u64,
          mob_kills: mob_kills as u64,
          player_kills: player_kills as u64,
          avg_ping,
          latest_tps,
        }))
      })
      .await??;

    Ok(overview)
  }

  // ========================================================================
  // Retention
  // ========================================================================

  /// Delete sessions that ended, and ping/TPS windows recorded, before `cutoff`.
  pub async fn remove_data_before(&self, cutoff: i64) -> Result<RemovedRows> {
    let removed = self
      .execute(move |tx| {
        let sessions = tx
          .prepare_cached("DELETE FROM sessions WHERE session_end < ?1")?
          .execute(params![cutoff])?;
        let ping = tx
          .prepare_cached("DELETE FROM ping WHERE date < ?1")?
          .execute(params![cutoff])?;
        let tps = tx
          .prepare_cached("DELETE FROM tps WHERE date < ?1")?
          .execute(params![cutoff])?;
        Ok(RemovedRows {
          sessions: sessions as u64,
          ping: ping as u64,
          tps: tps as u64,
        })
      })
      .await?;

    if removed.total() > 0 {
      debug!(
        sessions = removed.sessions,
        ping = removed.ping,
        tps = removed.tps,
        "removed old data"
      );
    }
    Ok(removed)
  }
}

// ============================================================================
// Row helpers
// ============================================================================

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
  let text: String = row.get(idx)?;
  Uuid::parse_str(&text)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn name_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<PlayerName> {
  let text: String = row.get(idx)?;
  PlayerName::from(&text).map_err(|e| {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e.simplify()))
  })
}

fn server_row(row: &Row<'_>) -> rusqlite::Result<ServerInfo> {
  Ok(ServerInfo {
    uuid: uuid_column(row, 0)?,
    name: row.get(1)?,
    registered_at: row.get(2)?,
  })
}

fn player_row(row: &Row<'_>) -> rusqlite::Result<PlayerInfo> {
  Ok(PlayerInfo {
    uuid: uuid_column(row, 0)?,
    name: name_column(row, 1)?,
    registered_at: row.get(2)?,
    last_address: row.get(3)?,
  })
}

fn kill_row(row: &Row<'_>) -> rusqlite::Result<KillRecord> {
  Ok(KillRecord {
    killer: uuid_column(row, 0)?,
    server: uuid_column(row, 1)?,
    kill: PlayerKill {
      victim: uuid_column(row, 2)?,
      weapon: row.get(3)?,
      date: row.get(4)?,
    },
  })
}

fn insert_session(tx: &Transaction<'_>, session: &FinishedSession) -> rusqlite::Result<i64> {
  tx.prepare_cached(
    "INSERT INTO sessions (player_uuid, server_uuid, session_start, session_end, afk_time, deaths, mob_kills)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
  )?
  .execute(params![
    session.player.to_string(),
    session.server.to_string(),
    session.start,
    session.end,
    session.afk_time,
    session.deaths,
    session.mob_kills
  ])?;
  let id = tx.last_insert_rowid();

  let mut times = tx.prepare_cached(
    "INSERT INTO world_times (session_id, world_name, game_mode, millis) VALUES (?1, ?2, ?3, ?4)",
  )?;
  for (world, game_mode, millis) in session.world_times.iter() {
    times.execute(params![id, world, game_mode, millis])?;
  }

  let mut kills = tx.prepare_cached(
    "INSERT INTO kills (session_id, killer_uuid, victim_uuid, server_uuid, weapon, date)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
  )?;
  for kill in &session.player_kills {
    kills.execute(params![
      id,
      session.player.to_string(),
      kill.victim.to_string(),
      session.server.to_string(),
      &kill.weapon,
      kill.date
    ])?;
  }

  Ok(id)
}

fn read_sessions<P: Params>(
  conn: &rusqlite::Connection,
  sql: &str,
  params: P,
) -> rusqlite::Result<Vec<FinishedSession>> {
  let rows = conn
    .prepare_cached(sql)?
    .query_map(params, |row| {
      Ok((
        row.get::<_, i64>(0)?,
        FinishedSession {
          player: uuid_column(row, 1)?,
          server: uuid_column(row, 2)?,
          start: row.get(3)?,
          end: row.get(4)?,
          afk_time: row.get(5)?,
          deaths: row.get(6)?,
          mob_kills: row.get(7)?,
          player_kills: Vec::new(),
          world_times: WorldTimes::new(),
        },
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut times_stmt = conn
    .prepare_cached("SELECT world_name, game_mode, millis FROM world_times WHERE session_id = ?1")?;
  let mut kills_stmt = conn.prepare_cached(
    "SELECT victim_uuid, weapon, date FROM kills WHERE session_id = ?1 ORDER BY date",
  )?;

  let mut sessions = Vec::with_capacity(rows.len());
  for (id, mut session) in rows {
    let mut times = times_stmt.query(params![id])?;
    while let Some(row) = times.next()? {
      let world: String = row.get(0)?;
      let game_mode: String = row.get(1)?;
      session.world_times.add(&world, &game_mode, row.get(2)?);
    }

    session.player_kills = kills_stmt
      .query_map(params![id], |row| {
        Ok(PlayerKill {
          victim: uuid_column(row, 0)?,
          weapon: row.get(1)?,
          date: row.get(2)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    sessions.push(session);
  }

  Ok(sessions)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn now() -> i64 {
    1_700_000_000_000 // Fixed timestamp for testing
  }

  fn name(value: &str) -> PlayerName {
    PlayerName::from(value).unwrap()
  }

  async fn setup() -> (Database, Uuid, Uuid) {
    let db = Database::open_in_memory().await.unwrap();
    let server = Uuid::new_v4();
    let player = Uuid::new_v4();
    db.register_server(server, "Survival".to_string(), now())
      .await
      .unwrap();
    db.register_player(player, name("Steve"), None, server, now())
      .await
      .unwrap();
    (db, server, player)
  }

  fn session(player: Uuid, server: Uuid, start: i64, end: i64) -> FinishedSession {
    FinishedSession {
      player,
      server,
      start,
      end,
      afk_time: 0,
      deaths: 0,
      mob_kills: 0,
      player_kills: Vec::new(),
      world_times: WorldTimes::new(),
    }
  }

  #[tokio::test]
  async fn test_server_registration_renames() {
    let db = Database::open_in_memory().await.unwrap();
    let server = Uuid::new_v4();

    let first = db
      .register_server(server, "Survival".to_string(), now())
      .await
      .unwrap();
    let renamed = db
      .register_server(server, "Survival SMP".to_string(), now() + 1000)
      .await
      .unwrap();

    assert_eq!(renamed.name, "Survival SMP");
    assert_eq!(renamed.registered_at, first.registered_at);
    assert_eq!(db.get_servers().await.unwrap().len(), 1);
    assert!(db.server_exists(server).await.unwrap());
    assert!(!db.server_exists(Uuid::new_v4()).await.unwrap());
  }

  #[tokio::test]
  async fn test_player_registration() {
    let (db, server, player) = setup().await;

    // Second join is not a new registration but keeps the latest name and address
    let created = db
      .register_player(player, name("Steve2"), Some("10.0.0.1".to_string()), server, now())
      .await
      .unwrap();
    assert!(!created);

    let info = db.get_player(player).await.unwrap().unwrap();
    assert_eq!(info.name.as_str(), "Steve2");
    assert_eq!(info.last_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(info.registered_at, now());

    // Unknown server is rejected
    let result = db
      .register_player(Uuid::new_v4(), name("Alex"), None, Uuid::new_v4(), now())
      .await;
    assert!(matches!(result, Err(DbError::ServerNotFound)));
  }

  #[tokio::test]
  async fn test_session_round_trip_with_details() {
    let (db, server, player) = setup().await;
    let victim = Uuid::new_v4();

    let mut finished = session(player, server, now(), now() + 60_000);
    finished.afk_time = 5_000;
    finished.deaths = 2;
    finished.mob_kills = 7;
    finished.world_times.add("world", "SURVIVAL", 40_000);
    finished.world_times.add("world_nether", "SURVIVAL", 20_000);
    finished.player_kills.push(PlayerKill {
      victim,
      weapon: "Diamond Sword".to_string(),
      date: now() + 30_000,
    });

    db.store_session(finished.clone()).await.unwrap();

    let stored = db.get_player_sessions(player).await.unwrap();
    assert_eq!(stored, vec![finished]);

    let kills = db.get_player_kills(Some(server)).await.unwrap();
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].killer, player);
    assert_eq!(kills[0].kill.victim, victim);
  }

  #[tokio::test]
  async fn test_sessions_newest_first_per_server() {
    let (db, server, player) = setup().await;
    let other = Uuid::new_v4();
    db.register_server(other, "Creative".to_string(), now())
      .await
      .unwrap();

    db.store_session(session(player, server, now(), now() + 100))
      .await
      .unwrap();
    db.store_session(session(player, other, now() + 100, now() + 500))
      .await
      .unwrap();
    db.store_session(session(player, server, now() + 500, now() + 900))
      .await
      .unwrap();

    let on_server = db.get_sessions(Some(server), 10).await.unwrap();
    assert_eq!(on_server.len(), 2);
    assert_eq!(on_server[0].start, now() + 500);

    let all = db.get_sessions(None, 2).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].server, other);
  }

  #[tokio::test]
  async fn test_failed_unit_of_work_rolls_back() {
    let (db, server, player) = setup().await;

    // Second insert violates the foreign key on players, so the whole unit fails
    let result = db
      .execute(move |tx| {
        insert_session(tx, &session(player, server, now(), now() + 10))?;
        insert_session(tx, &session(Uuid::new_v4(), server, now(), now() + 10))
      })
      .await;
    assert!(result.is_err());
    assert!(db.get_sessions(None, 10).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_ping_and_tps_series() {
    let (db, server, player) = setup().await;

    db.store_ping_aggregates(vec![
      PingAggregate {
        date: now(),
        player,
        server,
        min: 10,
        max: 30,
        avg: 20.0,
      },
      PingAggregate {
        date: now() + 30_000,
        player,
        server,
        min: 12,
        max: 40,
        avg: 30.0,
      },
    ])
    .await
    .unwrap();

    db.store_tps_records(vec![TpsRecord {
      date: now(),
      server,
      tps: 19.5,
      players_online: 3,
      cpu_usage: -1.0,
      ram_usage: 2048,
      entities: 400,
      chunks_loaded: 900,
      free_disk_space: 10_000,
    }])
    .await
    .unwrap();

    let ping = db.get_ping_series(server, now() + 1).await.unwrap();
    assert_eq!(ping.len(), 1);
    assert_eq!(ping[0].max, 40);

    let tps = db.get_tps_series(server, 0).await.unwrap();
    assert_eq!(tps.len(), 1);
    assert_eq!(tps[0].tps, 19.5);

    let overview = db.get_server_overview(server).await.unwrap();
    assert_eq!(overview.avg_ping, Some(25.0));
    assert_eq!(overview.latest_tps, Some(19.5));
  }

  #[tokio::test]
  async fn test_server_overview_totals() {
    let (db, server, player) = setup().await;
    let other_player = Uuid::new_v4();
    db.register_player(other_player, name("Alex"), None, server, now())
      .await
      .unwrap();

    let mut first = session(player, server, now(), now() + 1_000);
    first.deaths = 1;
    first.afk_time = 100;
    let mut second = session(other_player, server, now(), now() + 3_000);
    second.mob_kills = 4;
    second.player_kills.push(PlayerKill {
      victim: player,
      weapon: "Bow".to_string(),
      date: now() + 10,
    });
    db.store_session(first).await.unwrap();
    db.store_session(second).await.unwrap();

    let overview = db.get_server_overview(server).await.unwrap();
    assert_eq!(overview.sessions, 2);
    assert_eq!(overview.unique_players, 2);
    assert_eq!(overview.playtime, 4_000);
    assert_eq!(overview.afk_time, 100);
    assert_eq!(overview.deaths, 1);
    assert_eq!(overview.mob_kills, 4);
    assert_eq!(overview.player_kills, 1);
    assert_eq!(overview.avg_ping, None);
    assert_eq!(overview.latest_tps, None);

    let missing = db.get_server_overview(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(DbError::ServerNotFound)));
  }

  #[tokio::test]
  async fn test_remove_data_before_cascades() {
    let (db, server, player) = setup().await;

    let mut old = session(player, server, now() - 10_000, now() - 5_000);
    old.world_times.add("world", "SURVIVAL", 5_000);
    db.store_session(old).await.unwrap();
    db.store_session(session(player, server, now(), now() + 100))
      .await
      .unwrap();
    db.store_ping_aggregates(vec![PingAggregate {
      date: now() - 5_000,
      player,
      server,
      min: 1,
      max: 1,
      avg: 1.0,
    }])
    .await
    .unwrap();

    let removed = db.remove_data_before(now()).await.unwrap();
    assert_eq!(removed.sessions, 1);
    assert_eq!(removed.ping, 1);
    assert_eq!(removed.tps, 0);

    let orphaned: i64 = db
      .query(|conn| conn.query_row("SELECT COUNT(*) FROM world_times", [], |row| row.get(0)))
      .await
      .unwrap();
    assert_eq!(orphaned, 0);
    assert_eq!(db.get_sessions(None, 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_closed_database_rejects_work() {
    let (db, _server, player) = setup().await;
    let clone = db.clone();

    db.close();
    assert!(!clone.is_open());

    let result = clone.get_player(player).await;
    assert!(matches!(result, Err(DbError::Closed)));
    assert!(result.unwrap_err().is_unavailable());
  }

  #[tokio::test]
  async fn test_constraint_violation_is_not_unavailable() {
    let (db, server, _player) = setup().await;
    let stranger = FinishedSession {
      player: Uuid::new_v4(),
      server,
      start: 0,
      end: 10,
      afk_time: 0,
      deaths: 0,
      mob_kills: 0,
      player_kills: Vec::new(),
      world_times: WorldTimes::new(),
    };

    let err = db.store_session(stranger).await.unwrap_err();
    assert!(!err.is_unavailable(), "unexpected: {err:?}");
    assert!(db.is_open());
  }
}
