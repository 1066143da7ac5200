use std::time::Duration;

use lookout_db::TpsRecord;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate;
use crate::window::{FullWindow, ProbeError, Round, SampleSource, WindowedCollector};

pub const DEFAULT_TPS_WINDOW: usize = 60;
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(60);

/// Instantaneous server performance as reported by the platform.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PerformanceSample {
    pub tps: f64,
    pub players_online: i32,
    /// Percent, negative when unavailable
    #[serde(default = "unavailable_cpu")]
    pub cpu_usage: f64,
    /// Megabytes
    #[serde(default)]
    pub ram_usage: i64,
    #[serde(default)]
    pub entities: i32,
    #[serde(default)]
    pub chunks_loaded: i32,
    /// Megabytes
    #[serde(default)]
    pub free_disk_space: i64,
}

fn unavailable_cpu() -> f64 {
    -1.0
}

pub fn is_valid_sample(sample: &PerformanceSample) -> bool {
    sample.tps.is_finite() && sample.tps >= 0.0 && sample.players_online >= 0
}

/// Samples each server's performance once per tick and reduces full windows to [`TpsRecord`]s.
pub struct TpsCollector {
    window: WindowedCollector<PerformanceSample>,
    startup_delay: i64,
}

impl TpsCollector {
    pub fn new(startup_delay: Duration, window: usize) -> Self {
        Self {
            window: WindowedCollector::new(window, is_valid_sample),
            startup_delay: startup_delay.as_millis() as i64,
        }
    }

    /// Start sampling a server once the startup delay has passed.
    pub async fn add_server(&self, server: Uuid, started_at: i64) {
        self.window
            .track(server, server, started_at + self.startup_delay)
            .await;
        debug!(%server, "tracking performance");
    }

    pub async fn remove_server(&self, server: Uuid) -> bool {
        self.window.untrack(server).await
    }

    pub async fn is_tracking(&self, server: Uuid) -> bool {
        self.window.state(server).await.is_some()
    }

    pub async fn sample(
        &self,
        source: &dyn SampleSource<PerformanceSample>,
        now: i64,
    ) -> (Vec<TpsRecord>, Option<ProbeError>) {
        let Round { flushed, fault } = self.window.tick(source, now).await;
        (flushed.iter().map(reduce).collect(), fault)
    }
}

fn reduce(window: &FullWindow<PerformanceSample>) -> TpsRecord {
    let samples: Vec<&PerformanceSample> = window.samples.iter().map(|s| &s.value).collect();

    let tps: Vec<f64> = samples.iter().map(|s| s.tps).collect();
    let players: Vec<i32> = samples.iter().map(|s| s.players_online).collect();
    let cpu: Vec<f64> = samples
        .iter()
        .map(|s| s.cpu_usage)
        .filter(|cpu| *cpu >= 0.0)
        .collect();
    let entities: Vec<i32> = samples.iter().map(|s| s.entities).collect();
    let chunks: Vec<i32> = samples.iter().map(|s| s.chunks_loaded).collect();
    let ram: Vec<f64> = samples.iter().map(|s| s.ram_usage as f64).collect();

    TpsRecord {
        date: window.last_date(),
        server: window.owner,
        tps: aggregate::or_missing(aggregate::mean_f64(&tps)),
        players_online: aggregate::or_missing(aggregate::mean_truncated(&players)) as i32,
        cpu_usage: aggregate::or_missing(aggregate::mean_f64(&cpu)),
        ram_usage: aggregate::or_missing(aggregate::mean_f64(&ram)) as i64,
        entities: aggregate::or_missing(aggregate::mean_truncated(&entities)) as i32,
        chunks_loaded: aggregate::or_missing(aggregate::mean_truncated(&chunks)) as i32,
        free_disk_space: samples.last().map(|s| s.free_disk_space).unwrap_or(-1),
    }
}
