//! The capability set every platform adapter drives, and its core implementation.

use std::sync::Arc;

use async_trait::async_trait;
use lookout_db::{Database, DbError, FinishedSession, PlayerName};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ping::PingCollector;
use crate::session::{SessionAttributes, SessionCache};
use crate::views::{ChangeKind, ViewService};
use crate::window::Reported;

/// Weapon recorded for player kills when the platform did not name one.
pub const UNKNOWN_WEAPON: &str = "Unknown";

/// A player connecting to a server.
#[derive(Debug, Clone)]
pub struct Join {
    pub player: Uuid,
    pub server: Uuid,
    pub timestamp: i64,
    pub name: PlayerName,
    pub address: Option<String>,
    pub attributes: SessionAttributes,
}

/// Entry points through which platform events reach the session cache and ping collector.
///
/// Events for players without a running session are ignored rather than
/// rejected; duplicate and late events are normal.
#[async_trait]
pub trait ActivityListener: Send + Sync {
    async fn on_join(&self, join: Join) -> lookout_db::Result<()>;

    async fn on_quit(&self, player: Uuid, timestamp: i64) -> lookout_db::Result<()>;

    /// `attributes` describe where the player lands on the new server.
    async fn on_switch(
        &self,
        player: Uuid,
        new_server: Uuid,
        timestamp: i64,
        attributes: SessionAttributes,
    ) -> lookout_db::Result<()>;

    async fn on_death(
        &self,
        victim: Uuid,
        timestamp: i64,
        killer: Option<Uuid>,
        weapon: Option<String>,
    ) -> lookout_db::Result<()>;

    async fn on_world_change(
        &self,
        player: Uuid,
        world: String,
        game_mode: String,
        timestamp: i64,
    ) -> lookout_db::Result<()>;

    async fn on_activity(&self, player: Uuid, timestamp: i64) -> lookout_db::Result<()>;

    async fn on_mob_kill(&self, killer: Uuid, timestamp: i64) -> lookout_db::Result<()>;
}

/// Core listener: keeps sessions and ping tracking in step with platform
/// events, stores finished sessions, then invalidates derived views.
pub struct ActivityTracker {
    db: Database,
    sessions: Arc<SessionCache>,
    ping: Arc<PingCollector>,
    pings: Arc<Reported<i32>>,
    views: Arc<ViewService>,
}

impl ActivityTracker {
    pub fn new(
        db: Database,
        sessions: Arc<SessionCache>,
        ping: Arc<PingCollector>,
        pings: Arc<Reported<i32>>,
        views: Arc<ViewService>,
    ) -> Self {
        Self {
            db,
            sessions,
            ping,
            pings,
            views,
        }
    }

    /// Store a finished session, then invalidate what depends on it.
    pub async fn persist(&self, session: FinishedSession) -> lookout_db::Result<()> {
        let change = ChangeKind::SessionChange {
            server: session.server,
            player: session.player,
        };
        self.db.store_session(session).await?;
        self.views.notify(change).await;
        Ok(())
    }
}

#[async_trait]
impl ActivityListener for ActivityTracker {
    async fn on_join(&self, join: Join) -> lookout_db::Result<()> {
        let Join {
            player,
            server,
            timestamp,
            name,
            address,
            attributes,
        } = join;

        let created = self
            .db
            .register_player(player, name, address, server, timestamp)
            .await?;
        if created {
            self.views
                .notify(ChangeKind::PlayerRegistered { player })
                .await;
        }

        let replaced = self
            .sessions
            .open_session(player, server, timestamp, attributes)
            .await;
        self.ping.add_player(player, server, timestamp).await;
        debug!(%player, %server, %name, "player joined");

        match replaced {
            // Missed quit; the old session ends where the new one starts
            Some(previous) => self.persist(previous).await,
            None => {
                self.views
                    .notify(ChangeKind::SessionChange { server, player })
                    .await;
                Ok(())
            }
        }
    }

    async fn on_quit(&self, player: Uuid, timestamp: i64) -> lookout_db::Result<()> {
        self.ping.remove_player(player).await;
        self.pings.forget(player).await;
        match self.sessions.end_session(player, timestamp).await {
            Some(finished) => {
                debug!(%player, length = finished.length(), "player quit");
                self.persist(finished).await
            }
            None => {
                debug!(%player, "quit without an active session");
                Ok(())
            }
        }
    }

    async fn on_switch(
        &self,
        player: Uuid,
        new_server: Uuid,
        timestamp: i64,
        attributes: SessionAttributes,
    ) -> lookout_db::Result<()> {
        // A session can only be stored for a registered player
        if self.sessions.get_active_session(player).await.is_none()
            && self.db.get_player(player).await?.is_none()
        {
            warn!(%player, "switch for an unknown player");
            return Err(DbError::PlayerNotFound);
        }

        let replaced = self
            .sessions
            .open_session(player, new_server, timestamp, attributes)
            .await;
        self.ping.add_player(player, new_server, timestamp).await;
        debug!(%player, %new_server, "player switched server");

        match replaced {
            Some(previous) => self.persist(previous).await,
            None => {
                warn!(%player, "switch without an active session, opened a new one");
                self.views
                    .notify(ChangeKind::SessionChange {
                        server: new_server,
                        player,
                    })
                    .await;
                Ok(())
            }
        }
    }

    async fn on_death(
        &self,
        victim: Uuid,
        timestamp: i64,
        killer: Option<Uuid>,
        weapon: Option<String>,
    ) -> lookout_db::Result<()> {
        if self
            .sessions
            .mutate(victim, |s| s.record_death())
            .await
            .is_none()
        {
            debug!(%victim, "death without an active session");
        }

        if let Some(killer) = killer.filter(|k| *k != victim) {
            let weapon = weapon.unwrap_or_else(|| UNKNOWN_WEAPON.to_string());
            self.sessions
                .mutate(killer, |s| {
                    s.record_player_kill(victim, weapon, timestamp);
                    s.record_activity(timestamp);
                })
                .await;
        }
        Ok(())
    }

    async fn on_world_change(
        &self,
        player: Uuid,
        world: String,
        game_mode: String,
        timestamp: i64,
    ) -> lookout_db::Result<()> {
        self.sessions
            .mutate(player, |s| {
                s.record_activity(timestamp);
                s.change_world(world, game_mode, timestamp);
            })
            .await;
        Ok(())
    }

    async fn on_activity(&self, player: Uuid, timestamp: i64) -> lookout_db::Result<()> {
        self.sessions
            .mutate(player, |s| s.record_activity(timestamp))
            .await;
        Ok(())
    }

    async fn on_mob_kill(&self, killer: Uuid, timestamp: i64) -> lookout_db::Result<()> {
        self.sessions
            .mutate(killer, |s| {
                s.record_mob_kill();
                s.record_activity(timestamp);
            })
            .await;
        Ok(())
    }
}
