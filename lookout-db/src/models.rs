use std::collections::BTreeMap;

use arrayvec::ArrayString;
use serde::Serialize;
use uuid::Uuid;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

/// A game server that reports activity to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
  pub uuid: Uuid,
  /// User-provided server name
  pub name: String,
  /// Unix millis when the server first registered
  pub registered_at: i64,
}

/// A player seen on any of the servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerInfo {
  pub uuid: Uuid,
  /// Last known username
  pub name: PlayerName,
  /// Unix millis of the first join
  pub registered_at: i64,
  /// Address of the most recent join, if the platform reported one
  pub last_address: Option<String>,
}

/// One player killing another during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerKill {
  pub victim: Uuid,
  pub weapon: String,
  pub date: i64,
}

/// A player kill together with the session context it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillRecord {
  pub killer: Uuid,
  pub server: Uuid,
  #[serde(flatten)]
  pub kill: PlayerKill,
}

/// Milliseconds spent per world and game mode.
///
/// Keyed world -> game mode -> millis. BTreeMaps keep serialized views stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorldTimes {
  times: BTreeMap<String, BTreeMap<String, i64>>,
}

impl WorldTimes {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add `millis` to the given world and game mode. Non-positive spans are ignored.
  pub fn add(&mut self, world: &str, game_mode: &str, millis: i64) {
    if millis <= 0 {
      return;
    }
    *self
      .times
      .entry(world.to_string())
      .or_default()
      .entry(game_mode.to_string())
      .or_insert(0) += millis;
  }

  pub fn get(&self, world: &str, game_mode: &str) -> i64 {
    self
      .times
      .get(world)
      .and_then(|modes| modes.get(game_mode))
      .copied()
      .unwrap_or(0)
  }

  pub fn world_total(&self, world: &str) -> i64 {
    self
      .times
      .get(world)
      .map(|modes| modes.values().sum())
      .unwrap_or(0)
  }

  pub fn total(&self) -> i64 {
    self.times.values().flat_map(|modes| modes.values()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.times.is_empty()
  }

  /// Iterate (world, game mode, millis) triples.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str, i64)> {
    self.times.iter().flat_map(|(world, modes)| {
      modes
        .iter()
        .map(move |(mode, millis)| (world.as_str(), mode.as_str(), *millis))
    })
  }
}

/// A session that has ended. Produced once, stored once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedSession {
  pub player: Uuid,
  pub server: Uuid,
  pub start: i64,
  pub end: i64,
  pub afk_time: i64,
  pub deaths: u32,
  pub mob_kills: u32,
  pub player_kills: Vec<PlayerKill>,
  pub world_times: WorldTimes,
}

impl FinishedSession {
  /// Total session length in millis.
  pub fn length(&self) -> i64 {
    (self.end - self.start).max(0)
  }

  /// Session length minus time spent AFK.
  pub fn active_time(&self) -> i64 {
    (self.length() - self.afk_time).max(0)
  }
}

/// One flushed ping window for a player.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingAggregate {
  /// Timestamp of the last sample in the window
  pub date: i64,
  pub player: Uuid,
  pub server: Uuid,
  pub min: i32,
  pub max: i32,
  /// Median of the window; even windows keep the midpoint, no integer cast is applied
  pub avg: f64,
}

/// One flushed performance window for a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpsRecord {
  /// Timestamp of the last sample in the window
  pub date: i64,
  pub server: Uuid,
  pub tps: f64,
  pub players_online: i32,
  /// -1.0 when the platform could not report CPU usage
  pub cpu_usage: f64,
  /// Megabytes
  pub ram_usage: i64,
  pub entities: i32,
  pub chunks_loaded: i32,
  /// Megabytes
  pub free_disk_space: i64,
}

/// Totals for a single server, computed from stored sessions, ping and TPS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerOverview {
  pub server: Uuid,
  pub sessions: u64,
  pub unique_players: u64,
  pub playtime: i64,
  pub afk_time: i64,
  pub deaths: u64,
  pub mob_kills: u64,
  pub player_kills: u64,
  pub avg_ping: Option<f64>,
  pub latest_tps: Option<f64>,
}

/// Row counts deleted by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedRows {
  pub sessions: u64,
  pub ping: u64,
  pub tps: u64,
}

impl RemovedRows {
  pub fn total(&self) -> u64 {
    self.sessions + self.ping + self.tps
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_world_times_accumulate_per_mode() {
    let mut times = WorldTimes::new();
    times.add("world", "SURVIVAL", 1000);
    times.add("world", "SURVIVAL", 500);
    times.add("world", "CREATIVE", 200);
    times.add("world_nether", "SURVIVAL", 300);
    times.add("world_nether", "SURVIVAL", 0);

    assert_eq!(times.get("world", "SURVIVAL"), 1500);
    assert_eq!(times.world_total("world"), 1700);
    assert_eq!(times.total(), 2000);
    assert_eq!(times.get("world_the_end", "SURVIVAL"), 0);
    assert_eq!(times.iter().count(), 3);
  }

  #[test]
  fn test_finished_session_active_time() {
    let session = FinishedSession {
      player: Uuid::nil(),
      server: Uuid::nil(),
      start: 1_000,
      end: 11_000,
      afk_time: 4_000,
      deaths: 0,
      mob_kills: 0,
      player_kills: Vec::new(),
      world_times: WorldTimes::new(),
    };
    assert_eq!(session.length(), 10_000);
    assert_eq!(session.active_time(), 6_000);
  }
}
