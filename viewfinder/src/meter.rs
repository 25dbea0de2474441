use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Counters of frame loop cycles.
#[derive(Default)]
pub struct Meter {
    rendered_cycles: AtomicU64,
    skipped_cycles: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            rendered_cycles: AtomicU64::new(0),
            skipped_cycles: AtomicU64::new(0),
        }
    }

    pub fn tick_rendered(&self) {
        self.rendered_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_skipped(&self) {
        self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_rendered(&self) -> u64 {
        self.rendered_cycles.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_skipped(&self) -> u64 {
        self.skipped_cycles.swap(0, Ordering::Relaxed)
    }
}

/// Throughput of the frame loop over one logging period.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleRates {
    pub rendered_per_sec: f32,
    pub skipped_per_sec: f32,
    /// Share of cycles skipped, 0 to 1.
    pub skip_ratio: f32,
}

impl CycleRates {
    /// `None` when no cycle ran during `elapsed`.
    pub fn new(rendered: u64, skipped: u64, elapsed: Duration) -> Option<Self> {
        let total = rendered + skipped;
        let secs = elapsed.as_secs_f32();
        if total == 0 || secs <= 0.0 {
            return None;
        }

        Some(Self {
            rendered_per_sec: rendered as f32 / secs,
            skipped_per_sec: skipped as f32 / secs,
            skip_ratio: skipped as f32 / total as f32,
        })
    }
}

/// Log the cycle rates of [`METER`] every `period`.
pub fn spawn_meter_logger(period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(period);
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let rendered = METER.get_reset_rendered();
            let skipped = METER.get_reset_skipped();
            let Some(rates) = CycleRates::new(rendered, skipped, start.elapsed()) else {
                log::info!("No frame loop cycles in the last {:.1} s", period.as_secs_f32());
                continue;
            };

            log::info!(
                "Frames per second: {:.2} rendered, {:.2} skipped",
                rates.rendered_per_sec,
                rates.skipped_per_sec
            );
            if rates.skip_ratio > 0.5 {
                log::warn!(
                    "{:.0}% of cycles skipped, the model may be slower than the tick rate",
                    rates.skip_ratio * 100.0
                );
            }
        }
    })
}
