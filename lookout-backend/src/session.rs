use lookout_db::{FinishedSession, PlayerKill, WorldTimes};
use scc::HashMap;
use scc::hash_map::Entry;
use uuid::Uuid;

/// World and game mode a player is in when a session opens.
#[derive(Debug, Clone, Default)]
pub struct SessionAttributes {
    pub world: Option<String>,
    pub game_mode: Option<String>,
}

#[derive(Debug, Clone)]
struct WorldSpan {
    world: String,
    game_mode: String,
    since: i64,
}

/// A session that is still running. Only reachable through [`SessionCache`].
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub player: Uuid,
    pub server: Uuid,
    pub start: i64,
    pub afk_time: i64,
    pub deaths: u32,
    pub mob_kills: u32,
    pub player_kills: Vec<PlayerKill>,
    world_times: WorldTimes,
    current: Option<WorldSpan>,
    last_activity: i64,
    afk_threshold: i64,
}

impl ActiveSession {
    pub fn new(
        player: Uuid,
        server: Uuid,
        start: i64,
        attributes: SessionAttributes,
        afk_threshold: i64,
    ) -> Self {
        let current = attributes.world.map(|world| WorldSpan {
            world,
            game_mode: attributes.game_mode.unwrap_or_else(|| "SURVIVAL".to_string()),
            since: start,
        });
        Self {
            player,
            server,
            start,
            afk_time: 0,
            deaths: 0,
            mob_kills: 0,
            player_kills: Vec::new(),
            world_times: WorldTimes::new(),
            current,
            last_activity: start,
            afk_threshold,
        }
    }

    pub fn current_world(&self) -> Option<&str> {
        self.current.as_ref().map(|span| span.world.as_str())
    }

    pub fn current_game_mode(&self) -> Option<&str> {
        self.current.as_ref().map(|span| span.game_mode.as_str())
    }

    /// World times closed so far, excluding the span still in progress.
    pub fn world_times(&self) -> &WorldTimes {
        &self.world_times
    }

    /// Close the running world span and start a new one at `time`.
    pub fn change_world(&mut self, world: String, game_mode: String, time: i64) {
        self.close_span(time);
        self.current = Some(WorldSpan {
            world,
            game_mode,
            since: time.max(self.start),
        });
    }

    /// Record that the player did something. An idle gap of at least the
    /// AFK threshold is counted as AFK time.
    pub fn record_activity(&mut self, time: i64) {
        let idle = time - self.last_activity;
        if idle >= self.afk_threshold {
            self.afk_time += idle;
        }
        self.last_activity = self.last_activity.max(time);
    }

    pub fn record_death(&mut self) {
        self.deaths += 1;
    }

    pub fn record_mob_kill(&mut self) {
        self.mob_kills += 1;
    }

    pub fn record_player_kill(&mut self, victim: Uuid, weapon: String, time: i64) {
        self.player_kills.push(PlayerKill {
            victim,
            weapon,
            date: time,
        });
    }

    fn close_span(&mut self, time: i64) {
        if let Some(span) = self.current.take() {
            self.world_times
                .add(&span.world, &span.game_mode, time - span.since);
        }
    }

    /// Freeze the session at `end`. An end before the start is clamped to the start.
    pub fn finish(mut self, end: i64) -> FinishedSession {
        let end = end.max(self.start);
        self.close_span(end);
        if end - self.last_activity >= self.afk_threshold {
            self.afk_time += end - self.last_activity;
        }
        FinishedSession {
            player: self.player,
            server: self.server,
            start: self.start,
            end,
            afk_time: self.afk_time.min(end - self.start),
            deaths: self.deaths,
            mob_kills: self.mob_kills,
            player_kills: self.player_kills,
            world_times: self.world_times,
        }
    }
}

/// Active sessions keyed by player.
///
/// Each operation holds the player's entry lock for its whole duration, so
/// open/mutate/end on one player are serialized while different players
/// proceed concurrently.
pub struct SessionCache {
    sessions: HashMap<Uuid, ActiveSession>,
    afk_threshold: i64,
}

impl SessionCache {
    pub fn new(afk_threshold: i64) -> Self {
        Self {
            sessions: HashMap::new(),
            afk_threshold,
        }
    }

    /// Install a new session for `player`.
    /// A session already running is finished at `start` and returned for storage.
    pub async fn open_session(
        &self,
        player: Uuid,
        server: Uuid,
        start: i64,
        attributes: SessionAttributes,
    ) -> Option<FinishedSession> {
        let session = ActiveSession::new(player, server, start, attributes, self.afk_threshold);
        match self.sessions.entry_async(player).await {
            Entry::Occupied(mut entry) => {
                let previous = std::mem::replace(entry.get_mut(), session);
                Some(previous.finish(start))
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(session);
                None
            }
        }
    }

    /// Apply `f` to the player's session. Returns None if no session is running.
    pub async fn mutate<R>(&self, player: Uuid, f: impl FnOnce(&mut ActiveSession) -> R) -> Option<R> {
        self.sessions
            .update_async(&player, |_, session| f(session))
            .await
    }

    /// Remove and finish the player's session. Returns None if already ended.
    pub async fn end_session(&self, player: Uuid, end: i64) -> Option<FinishedSession> {
        self.sessions
            .remove_async(&player)
            .await
            .map(|(_, session)| session.finish(end))
    }

    /// Get a copy of the player's running session.
    pub async fn get_active_session(&self, player: Uuid) -> Option<ActiveSession> {
        self.sessions
            .read_async(&player, |_, session| session.clone())
            .await
    }

    /// Finish every running session at `now` and empty the cache.
    pub async fn flush_all(&self, now: i64) -> Vec<FinishedSession> {
        let mut finished = Vec::with_capacity(self.sessions.len());
        self.sessions
            .retain_async(|_, session| {
                finished.push(session.clone().finish(now));
                false
            })
            .await;
        finished
    }

    /// Players currently online on `server` with their session start.
    pub async fn online_on(&self, server: Uuid) -> Vec<(Uuid, i64)> {
        let mut online = Vec::new();
        self.sessions
            .retain_async(|player, session| {
                if session.server == server {
                    online.push((*player, session.start));
                }
                true
            })
            .await;
        online.sort_by_key(|(_, start)| *start);
        online
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const AFK: i64 = 180_000;

    fn in_world(world: &str) -> SessionAttributes {
        SessionAttributes {
            world: Some(world.to_string()),
            game_mode: Some("SURVIVAL".to_string()),
        }
    }

    #[tokio::test]
    async fn test_open_replaces_existing_session() {
        let cache = SessionCache::new(AFK);
        let player = Uuid::new_v4();
        let (s1, s2, s3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(cache.open_session(player, s1, 0, SessionAttributes::default()).await.is_none());
        let first = cache
            .open_session(player, s2, 100, SessionAttributes::default())
            .await
            .unwrap();
        let second = cache
            .open_session(player, s3, 250, SessionAttributes::default())
            .await
            .unwrap();

        assert_eq!((first.server, first.start, first.end), (s1, 0, 100));
        assert_eq!((second.server, second.start, second.end), (s2, 100, 250));
        assert_eq!(cache.active_count(), 1);
        assert_eq!(cache.get_active_session(player).await.unwrap().server, s3);
    }

    #[tokio::test]
    async fn test_end_session_twice_returns_none() {
        let cache = SessionCache::new(AFK);
        let player = Uuid::new_v4();
        cache
            .open_session(player, Uuid::new_v4(), 0, SessionAttributes::default())
            .await;

        let finished = cache.end_session(player, 500).await.unwrap();
        assert_eq!(finished.end, 500);
        assert!(cache.end_session(player, 600).await.is_none());
        assert!(cache.get_active_session(player).await.is_none());
    }

    #[tokio::test]
    async fn test_mutate_missing_session_is_noop() {
        let cache = SessionCache::new(AFK);
        let result = cache.mutate(Uuid::new_v4(), |s| s.record_death()).await;
        assert!(result.is_none());
        assert_eq!(cache.active_count(), 0);
    }

    #[tokio::test]
    async fn test_mutations_are_carried_into_finished_session() {
        let cache = SessionCache::new(AFK);
        let player = Uuid::new_v4();
        let victim = Uuid::new_v4();
        cache
            .open_session(player, Uuid::new_v4(), 0, in_world("world"))
            .await;

        cache.mutate(player, |s| s.record_death()).await.unwrap();
        cache.mutate(player, |s| s.record_mob_kill()).await.unwrap();
        cache.mutate(player, |s| s.record_mob_kill()).await.unwrap();
        cache
            .mutate(player, |s| s.record_player_kill(victim, "Bow".to_string(), 40))
            .await
            .unwrap();
        cache
            .mutate(player, |s| {
                s.change_world("world_nether".to_string(), "SURVIVAL".to_string(), 1_000)
            })
            .await
            .unwrap();

        let finished = cache.end_session(player, 4_000).await.unwrap();
        assert_eq!(finished.deaths, 1);
        assert_eq!(finished.mob_kills, 2);
        assert_eq!(finished.player_kills.len(), 1);
        assert_eq!(finished.player_kills[0].victim, victim);
        assert_eq!(finished.world_times.get("world", "SURVIVAL"), 1_000);
        assert_eq!(finished.world_times.get("world_nether", "SURVIVAL"), 3_000);
    }

    #[tokio::test]
    async fn test_afk_gaps_are_counted() {
        let cache = SessionCache::new(AFK);
        let player = Uuid::new_v4();
        cache
            .open_session(player, Uuid::new_v4(), 0, SessionAttributes::default())
            .await;

        // Short gap, not AFK
        cache.mutate(player, |s| s.record_activity(60_000)).await;
        // Idle for 200s, counted
        cache.mutate(player, |s| s.record_activity(260_000)).await;
        // Idle until quit at 460s, counted on finish
        let finished = cache.end_session(player, 460_000).await.unwrap();

        assert_eq!(finished.afk_time, 400_000);
        assert_eq!(finished.active_time(), 60_000);
    }

    #[tokio::test]
    async fn test_flush_all_finishes_every_session() {
        let cache = SessionCache::new(AFK);
        let server = Uuid::new_v4();
        for start in 0..5 {
            cache
                .open_session(Uuid::new_v4(), server, start, SessionAttributes::default())
                .await;
        }

        let finished = cache.flush_all(1_000).await;
        assert_eq!(finished.len(), 5);
        assert!(finished.iter().all(|s| s.end == 1_000));
        assert_eq!(cache.active_count(), 0);
    }

    #[tokio::test]
    async fn test_online_on_filters_by_server() {
        let cache = SessionCache::new(AFK);
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.open_session(a, s1, 20, SessionAttributes::default()).await;
        cache.open_session(b, s1, 10, SessionAttributes::default()).await;
        cache.open_session(c, s2, 0, SessionAttributes::default()).await;

        assert_eq!(cache.online_on(s1).await, vec![(b, 10), (a, 20)]);
        assert_eq!(cache.online_on(s2).await, vec![(c, 0)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_keep_one_session() {
        let cache = Arc::new(SessionCache::new(AFK));
        let player = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .open_session(player, Uuid::new_v4(), i, SessionAttributes::default())
                    .await
            }));
        }

        let mut replaced = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                replaced += 1;
            }
        }

        // Every open except the first replaced exactly one session
        assert_eq!(replaced, 31);
        assert_eq!(cache.active_count(), 1);
        assert!(cache.end_session(player, 100).await.is_some());
        assert!(cache.end_session(player, 100).await.is_none());
    }
}
