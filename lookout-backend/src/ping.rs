use std::time::Duration;

use lookout_db::PingAggregate;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{self, AveragePolicy};
use crate::window::{FullWindow, ProbeError, Round, SampleSource, TrackingState, WindowedCollector};

/// Highest round-trip time that is still considered a real measurement.
pub const MAX_PING_MS: i32 = 8_000;

/// Login delays this long or longer turn ping tracking off.
pub const DISABLED_LOGIN_DELAY: Duration = Duration::from_secs(2 * 60 * 60);

pub const DEFAULT_PING_WINDOW: usize = 30;

pub fn is_valid_ping(ms: &i32) -> bool {
    (0..=MAX_PING_MS).contains(ms)
}

/// Buffers per-player ping samples and reduces every full window to a [`PingAggregate`].
pub struct PingCollector {
    window: WindowedCollector<i32>,
    login_delay: Option<i64>,
    average: AveragePolicy,
}

impl PingCollector {
    pub fn new(login_delay: Duration, window: usize) -> Self {
        let login_delay =
            (login_delay < DISABLED_LOGIN_DELAY).then(|| login_delay.as_millis() as i64);
        Self {
            window: WindowedCollector::new(window, is_valid_ping),
            login_delay,
            average: AveragePolicy::Median,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.login_delay.is_some()
    }

    /// Start tracking a player after the login delay. Returns false when tracking is disabled.
    pub async fn add_player(&self, player: Uuid, server: Uuid, joined_at: i64) -> bool {
        let Some(delay) = self.login_delay else {
            return false;
        };
        self.window.track(player, server, joined_at + delay).await;
        debug!(%player, %server, delay, "tracking ping");
        true
    }

    /// Forget a player. Pending activation and the partial window are both dropped.
    pub async fn remove_player(&self, player: Uuid) -> bool {
        self.window.untrack(player).await
    }

    pub async fn state(&self, player: Uuid) -> Option<TrackingState> {
        self.window.state(player).await
    }

    pub fn tracked_count(&self) -> usize {
        self.window.tracked_count()
    }

    /// Run one sampling tick and reduce every window that filled up.
    pub async fn sample(
        &self,
        source: &dyn SampleSource<i32>,
        now: i64,
    ) -> (Vec<PingAggregate>, Option<ProbeError>) {
        let Round { flushed, fault } = self.window.tick(source, now).await;
        let aggregates = flushed.iter().map(|w| self.reduce(w)).collect();
        (aggregates, fault)
    }

    fn reduce(&self, window: &FullWindow<i32>) -> PingAggregate {
        let values: Vec<i32> = window.samples.iter().map(|s| s.value).collect();
        PingAggregate {
            date: window.last_date(),
            player: window.key,
            server: window.owner,
            min: aggregate::or_missing(aggregate::min(&values)),
            max: aggregate::or_missing(aggregate::max(&values)),
            avg: aggregate::or_missing(self.average.apply(&values)),
        }
    }
}
