//! Derived JSON views served to the dashboard, backed by [`JsonCache`].

use std::sync::Arc;

use lookout_db::{Database, DbError, PlayerInfo};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::helpers::now;
use crate::json_cache::{CacheKey, DataTag, JsonCache};
use crate::session::SessionCache;

const RECENT_SESSIONS: usize = 50;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("view {0:?} needs a server or player scope")]
    MissingScope(DataTag),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("failed to serialize view: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Something changed that derived views may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A session opened, or a finished session was stored.
    SessionChange { server: Uuid, player: Uuid },
    PingStored { server: Uuid },
    PerformanceStored { server: Uuid },
    ServerStateChange { server: Uuid },
    PlayerRegistered { player: Uuid },
    /// Retention removed stored rows.
    DataRemoved,
}

#[derive(Serialize)]
struct ServerView {
    uuid: Uuid,
    name: String,
    registered_at: i64,
    online: usize,
}

#[derive(Serialize)]
struct OnlinePlayer {
    player: Uuid,
    session_start: i64,
}

#[derive(Serialize)]
struct ServerOverviewView {
    #[serde(flatten)]
    stored: lookout_db::ServerOverview,
    online: usize,
}

#[derive(Serialize)]
struct PlayerOverviewView {
    #[serde(flatten)]
    player: PlayerInfo,
    sessions: usize,
    playtime: i64,
    afk_time: i64,
    deaths: u64,
    mob_kills: u64,
    player_kills: usize,
    online_on: Option<Uuid>,
}

/// Serves `request(tag, scope)` for the web layer and turns change
/// notifications into cache invalidations.
pub struct ViewService {
    db: Database,
    sessions: Arc<SessionCache>,
    cache: Arc<JsonCache>,
    /// How far back graph views reach, in millis
    graph_span: i64,
}

impl ViewService {
    pub fn new(db: Database, sessions: Arc<SessionCache>, cache: Arc<JsonCache>, graph_span: i64) -> Self {
        Self {
            db,
            sessions,
            cache,
            graph_span,
        }
    }

    pub fn cache(&self) -> &JsonCache {
        &self.cache
    }

    /// Cached payload for `tag` and `scope`, computed on a miss.
    pub async fn request(&self, tag: DataTag, scope: Option<Uuid>) -> Result<Arc<str>, ViewError> {
        let key = CacheKey { tag, scope };
        self.cache
            .get_or_compute(key, now(), || self.compute(key))
            .await
    }

    /// Invalidate everything derived from the change.
    /// Callers notify only after the storage write behind the change has completed.
    pub async fn notify(&self, change: ChangeKind) {
        debug!(?change, "invalidating views");
        match change {
            ChangeKind::SessionChange { player, .. } => {
                self.cache
                    .invalidate_matching(&[
                        DataTag::Servers,
                        DataTag::Sessions,
                        DataTag::Players,
                        DataTag::ServerOverview,
                        DataTag::KillsTable,
                        DataTag::OnlineNow,
                    ])
                    .await;
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::PlayerOverview, player))
                    .await;
            }
            ChangeKind::PingStored { server } => {
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::GraphPing, server))
                    .await;
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::ServerOverview, server))
                    .await;
            }
            ChangeKind::PerformanceStored { server } => {
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::GraphPerformance, server))
                    .await;
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::ServerOverview, server))
                    .await;
            }
            ChangeKind::ServerStateChange { .. } => {
                self.cache
                    .invalidate_matching(&[
                        DataTag::Servers,
                        DataTag::ServerOverview,
                        DataTag::OnlineNow,
                    ])
                    .await;
            }
            ChangeKind::PlayerRegistered { player } => {
                self.cache.invalidate_matching(&[DataTag::Players]).await;
                self.cache
                    .invalidate(CacheKey::scoped(DataTag::PlayerOverview, player))
                    .await;
            }
            ChangeKind::DataRemoved => self.cache.invalidate_all().await,
        }
    }

    async fn compute(&self, key: CacheKey) -> Result<String, ViewError> {
        let scope = || key.scope.ok_or(ViewError::MissingScope(key.tag));

        let payload = match key.tag {
            DataTag::Servers => {
                let mut servers = Vec::new();
                for server in self.db.get_servers().await? {
                    let online = self.sessions.online_on(server.uuid).await.len();
                    servers.push(ServerView {
                        uuid: server.uuid,
                        name: server.name,
                        registered_at: server.registered_at,
                        online,
                    });
                }
                serde_json::to_string(&servers)?
            }
            DataTag::Players => serde_json::to_string(&self.db.get_players().await?)?,
            DataTag::Sessions => {
                serde_json::to_string(&self.db.get_sessions(key.scope, RECENT_SESSIONS).await?)?
            }
            DataTag::KillsTable => {
                serde_json::to_string(&self.db.get_player_kills(key.scope).await?)?
            }
            DataTag::ServerOverview => {
                let server = scope()?;
                let stored = self.db.get_server_overview(server).await?;
                let online = self.sessions.online_on(server).await.len();
                serde_json::to_string(&ServerOverviewView { stored, online })?
            }
            DataTag::PlayerOverview => {
                let player = scope()?;
                let info = self
                    .db
                    .get_player(player)
                    .await?
                    .ok_or(DbError::PlayerNotFound)?;
                let sessions = self.db.get_player_sessions(player).await?;
                let online_on = self
                    .sessions
                    .get_active_session(player)
                    .await
                    .map(|s| s.server);
                serde_json::to_string(&PlayerOverviewView {
                    player: info,
                    sessions: sessions.len(),
                    playtime: sessions.iter().map(|s| s.length()).sum(),
                    afk_time: sessions.iter().map(|s| s.afk_time).sum(),
                    deaths: sessions.iter().map(|s| s.deaths as u64).sum(),
                    mob_kills: sessions.iter().map(|s| s.mob_kills as u64).sum(),
                    player_kills: sessions.iter().map(|s| s.player_kills.len()).sum(),
                    online_on,
                })?
            }
            DataTag::OnlineNow => {
                let online: Vec<OnlinePlayer> = self
                    .sessions
                    .online_on(scope()?)
                    .await
                    .into_iter()
                    .map(|(player, session_start)| OnlinePlayer {
                        player,
                        session_start,
                    })
                    .collect();
                serde_json::to_string(&online)?
            }
            DataTag::GraphPing => {
                let after = now() - self.graph_span;
                let series = self.db.get_ping_series(scope()?, after).await?;
                serde_json::to_string(&series)?
            }
            DataTag::GraphPerformance => {
                let after = now() - self.graph_span;
                let series = self.db.get_tps_series(scope()?, after).await?;
                serde_json::to_string(&series)?
            }
        };

        debug!(?key, bytes = payload.len(), "computed view");
        Ok(payload)
    }
}
