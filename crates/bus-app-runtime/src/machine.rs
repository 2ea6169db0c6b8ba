use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;
use tracing::debug;

const MIN_POLL: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(5);

/// 1, 5 and 15 minute load averages
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Host resource readings, refreshed on every query.
#[derive(Clone)]
pub struct MachineStats {
    system: Arc<Mutex<System>>,
}

impl MachineStats {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // Prime the CPU counters; usage is a delta between two refreshes
        system.refresh_cpu_usage();
        MachineStats {
            system: Arc::new(Mutex::new(system)),
        }
    }

    /// Percentage of physical memory in use
    pub fn memory(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 * 100.0 / total as f64
    }

    /// Global CPU usage percentage since the previous reading
    pub fn cpu(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.global_cpu_usage() as f64
    }

    pub fn load(&self) -> LoadAverage {
        let load = System::load_average();
        LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        }
    }

    /// Wait until memory usage is at or below `limit` percent
    pub async fn await_memory(&self, limit: f64, time_limit: Option<Duration>) -> f64 {
        await_below(|| self.memory(), limit, time_limit).await
    }

    /// Wait until CPU usage is at or below `limit` percent
    pub async fn await_cpu(&self, limit: f64, time_limit: Option<Duration>) -> f64 {
        await_below(|| self.cpu(), limit, time_limit).await
    }
}

impl Default for MachineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval between two readings: a twentieth of the time limit, kept
/// between 1 and 5 seconds.
pub fn poll_interval(time_limit: Option<Duration>) -> Duration {
    match time_limit {
        Some(limit) => (limit / 20).clamp(MIN_POLL, MAX_POLL),
        None => MIN_POLL,
    }
}

/// Poll `sample` until it reads at or below `limit` or `time_limit` runs
/// out. Returns the last reading either way.
pub async fn await_below<P>(mut sample: P, limit: f64, time_limit: Option<Duration>) -> f64
where
    P: FnMut() -> f64,
{
    let started = Instant::now();
    let interval = poll_interval(time_limit);

    loop {
        let value = sample();
        if value <= limit {
            return value;
        }
        if let Some(time_limit) = time_limit {
            if started.elapsed() >= time_limit {
                debug!("Gave up waiting for {:.1} <= {:.1}", value, limit);
                return value;
            }
        }
        debug!("Reading {:.1} above {:.1}, checking again in {:?}", value, limit, interval);
        tokio::time::sleep(interval).await;
    }
}
