pub mod aggregate;
pub mod config;
mod error;
pub mod events;
pub mod helpers;
pub mod json_cache;
pub mod ping;
pub mod processing;
mod routes;
pub mod session;
pub mod tasks;
pub mod tps;
mod validation;
pub mod views;
pub mod window;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use lookout_db::{Database, PingAggregate, ServerInfo, TpsRecord};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{ActivityListener, ActivityTracker};
use crate::helpers::{millis, now};
use crate::json_cache::JsonCache;
use crate::ping::PingCollector;
use crate::processing::Processing;
use crate::session::SessionCache;
use crate::tasks::TaskRegistry;
use crate::tps::{PerformanceSample, TpsCollector};
use crate::views::{ChangeKind, ViewService};
use crate::window::Reported;

/// Reported samples older than this count as missing
const REPORT_MAX_AGE: Duration = Duration::from_secs(10);
/// How far back graph views reach
const GRAPH_SPAN: Duration = Duration::from_secs(24 * 60 * 60);
/// Grace period for periodic tasks to notice shutdown
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Every long-lived component of the backend, created once at startup.
pub struct Lookout {
    pub config: Config,
    pub db: Database,
    pub sessions: Arc<SessionCache>,
    pub ping: Arc<PingCollector>,
    pub tps: Arc<TpsCollector>,
    /// Latest ping per player, pushed by the platform
    pub pings: Arc<Reported<i32>>,
    /// Latest performance snapshot per server, pushed by the platform
    pub performance: Arc<Reported<PerformanceSample>>,
    pub views: Arc<ViewService>,
    pub events: Arc<dyn ActivityListener>,
    tracker: Arc<ActivityTracker>,
    processing: Arc<Processing>,
    tasks: TaskRegistry,
}

impl Lookout {
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        let sessions = Arc::new(SessionCache::new(millis(config.afk_threshold)));
        let ping = Arc::new(PingCollector::new(config.ping_login_delay, config.ping_window));
        let tps = Arc::new(TpsCollector::new(config.tps_startup_delay, config.tps_window));
        let cache = Arc::new(JsonCache::new(millis(config.json_cache_ttl)));
        let views = Arc::new(ViewService::new(
            db.clone(),
            sessions.clone(),
            cache,
            millis(GRAPH_SPAN),
        ));
        let pings = Arc::new(Reported::new(millis(REPORT_MAX_AGE)));
        let tracker = Arc::new(ActivityTracker::new(
            db.clone(),
            sessions.clone(),
            ping.clone(),
            pings.clone(),
            views.clone(),
        ));

        Arc::new(Self {
            processing: Arc::new(Processing::new(config.non_critical_limit)),
            pings,
            performance: Arc::new(Reported::new(millis(REPORT_MAX_AGE))),
            events: tracker.clone(),
            tasks: TaskRegistry::new(),
            config,
            db,
            sessions,
            ping,
            tps,
            views,
            tracker,
        })
    }

    /// Resume performance tracking for known servers and start the periodic tasks.
    pub async fn start(&self) -> lookout_db::Result<()> {
        let started_at = now();
        for server in self.db.get_servers().await? {
            self.tps.add_server(server.uuid, started_at).await;
        }

        self.start_ping_task();
        self.start_tps_task();
        self.start_cache_cleanup_task();
        self.start_retention_task();
        info!("background tasks started");
        Ok(())
    }

    /// Register a server and begin sampling its performance.
    pub async fn register_server(&self, uuid: Uuid, name: String) -> lookout_db::Result<ServerInfo> {
        let registered_at = now();
        let server = self.db.register_server(uuid, name, registered_at).await?;
        if !self.tps.is_tracking(uuid).await {
            self.tps.add_server(uuid, registered_at).await;
        }
        self.views
            .notify(ChangeKind::ServerStateChange { server: uuid })
            .await;
        Ok(server)
    }

    /// Persist every open session, stop the periodic tasks and close storage.
    pub async fn shutdown(&self) {
        let open = self.sessions.flush_all(now()).await;
        info!(sessions = open.len(), "persisting open sessions");
        for session in open {
            let tracker = self.tracker.clone();
            self.processing.critical(async move {
                let player = session.player;
                if let Err(e) = tracker.persist(session).await {
                    warn!(%player, error = %e, "failed to persist session on shutdown");
                }
            });
        }

        self.tasks.shutdown(TASK_STOP_TIMEOUT).await;

        let aborted = self.processing.drain(self.config.shutdown_timeout).await;
        if aborted > 0 {
            warn!(aborted, "shutdown timed out, some sessions were not stored");
        }

        self.db.close();
        self.views.cache().invalidate_all().await;
        info!("shutdown complete");
    }

    fn start_ping_task(&self) {
        if !self.ping.is_enabled() {
            info!("ping tracking disabled");
            return;
        }

        let ping = self.ping.clone();
        let source = self.pings.clone();
        let processing = self.processing.clone();
        let db = self.db.clone();
        let views = self.views.clone();
        let period = self.config.sample_interval;

        self.tasks.spawn_interval("ping", period, period, move || {
            let (ping, source, processing) = (ping.clone(), source.clone(), processing.clone());
            let (db, views) = (db.clone(), views.clone());
            async move {
                let (aggregates, fault) = ping.sample(&*source, now()).await;
                if !aggregates.is_empty() {
                    processing.non_critical(store_pings(db, views, aggregates));
                }
                match fault {
                    Some(e) => {
                        error!(error = %e, "ping sampling stopped");
                        ControlFlow::Break(())
                    }
                    None => ControlFlow::Continue(()),
                }
            }
        });
    }

    fn start_tps_task(&self) {
        let tps = self.tps.clone();
        let source = self.performance.clone();
        let processing = self.processing.clone();
        let db = self.db.clone();
        let views = self.views.clone();
        let period = self.config.sample_interval;

        self.tasks.spawn_interval("tps", period, period, move || {
            let (tps, source, processing) = (tps.clone(), source.clone(), processing.clone());
            let (db, views) = (db.clone(), views.clone());
            async move {
                let (records, fault) = tps.sample(&*source, now()).await;
                if !records.is_empty() {
                    processing.non_critical(store_performance(db, views, records));
                }
                match fault {
                    Some(e) => {
                        error!(error = %e, "performance sampling stopped");
                        ControlFlow::Break(())
                    }
                    None => ControlFlow::Continue(()),
                }
            }
        });
    }

    fn start_cache_cleanup_task(&self) {
        let views = self.views.clone();
        let pings = self.pings.clone();
        let performance = self.performance.clone();
        let period = self.config.json_cache_cleanup;

        self.tasks.spawn_interval("json-cache-cleanup", period, period, move || {
            let (views, pings, performance) = (views.clone(), pings.clone(), performance.clone());
            async move {
                let now = now();
                views.cache().clean_up(now).await;
                let purged = pings.purge_stale(now).await + performance.purge_stale(now).await;
                if purged > 0 {
                    debug!(purged, "dropped stale reports");
                }
                ControlFlow::Continue(())
            }
        });
    }

    fn start_retention_task(&self) {
        let db = self.db.clone();
        let views = self.views.clone();
        let retention = millis(self.config.data_retention);
        let period = self.config.retention_interval;

        self.tasks.spawn_interval("retention", period, period, move || {
            let (db, views) = (db.clone(), views.clone());
            async move {
                if !db.is_open() {
                    debug!("storage closed, skipping retention");
                    return ControlFlow::Continue(());
                }
                match db.remove_data_before(now() - retention).await {
                    Ok(removed) if removed.total() > 0 => {
                        info!(
                            sessions = removed.sessions,
                            ping = removed.ping,
                            tps = removed.tps,
                            "removed old data"
                        );
                        views.notify(ChangeKind::DataRemoved).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "retention failed"),
                }
                ControlFlow::Continue(())
            }
        });
    }
}

async fn store_pings(db: Database, views: Arc<ViewService>, aggregates: Vec<PingAggregate>) {
    if !db.is_open() {
        debug!(count = aggregates.len(), "storage closed, dropping ping aggregates");
        return;
    }

    let mut stored = BTreeSet::new();
    if let Err(e) = db.store_ping_aggregates(aggregates.clone()).await {
        if e.is_unavailable() {
            debug!(error = %e, "storage unavailable, dropping ping aggregates");
            return;
        }
        warn!(error = %e, "ping batch failed, storing aggregates one by one");
        for aggregate in aggregates {
            let (player, server) = (aggregate.player, aggregate.server);
            match db.store_ping_aggregates(vec![aggregate]).await {
                Ok(_) => {
                    stored.insert(server);
                }
                Err(e) => warn!(%player, %server, error = %e, "failed to store ping aggregate"),
            }
        }
    } else {
        stored.extend(aggregates.iter().map(|a| a.server));
    }

    for server in stored {
        views.notify(ChangeKind::PingStored { server }).await;
    }
}

async fn store_performance(db: Database, views: Arc<ViewService>, records: Vec<TpsRecord>) {
    if !db.is_open() {
        debug!(count = records.len(), "storage closed, dropping performance records");
        return;
    }

    let mut stored = BTreeSet::new();
    if let Err(e) = db.store_tps_records(records.clone()).await {
        if e.is_unavailable() {
            debug!(error = %e, "storage unavailable, dropping performance records");
            return;
        }
        warn!(error = %e, "performance batch failed, storing records one by one");
        for record in records {
            let server = record.server;
            match db.store_tps_records(vec![record]).await {
                Ok(_) => {
                    stored.insert(server);
                }
                Err(e) => warn!(%server, error = %e, "failed to store performance record"),
            }
        }
    } else {
        stored.extend(records.iter().map(|r| r.server));
    }

    for server in stored {
        views.notify(ChangeKind::PerformanceStored { server }).await;
    }
}

/// Create the application router for the given backend
pub fn create_app(
    lookout: Arc<Lookout>,
    request_body_limit: usize,
    request_timeout: Duration,
) -> Router {
    let event_routes = Router::new()
        .route("/join", post(routes::join))
        .route("/quit", post(routes::quit))
        .route("/switch", post(routes::switch))
        .route("/death", post(routes::death))
        .route("/world", post(routes::world_change))
        .route("/activity", post(routes::activity))
        .route("/mob-kill", post(routes::mob_kill));

    let report_routes = Router::new()
        .route("/ping", post(routes::report_ping))
        .route("/performance", post(routes::report_performance));

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/servers", post(routes::register_server))
        .route("/v1/{tag}", get(routes::view))
        .merge(event_routes)
        .merge(report_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(request_body_limit))
        .with_state(lookout)
}
