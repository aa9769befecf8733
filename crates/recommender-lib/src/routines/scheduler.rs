//! Timer-driven execution of periodic routines

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest period a routine runs at.
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// A unit of periodic work.
///
/// `run_once` takes `&mut self`, so a routine is never invoked again before
/// the previous invocation returned.
#[async_trait]
pub trait Routine: Send {
    fn name(&self) -> &'static str;

    async fn run_once(&mut self);
}

/// Run `routine` every `period` until `shutdown` fires.
///
/// The first run starts immediately. A shutdown signal received while a run
/// is in flight lets that run complete; no further run starts afterwards.
/// Ticks missed because a run overran are not made up.
pub async fn run_periodically<R: Routine>(
    mut routine: R,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> R {
    info!(
        routine = routine.name(),
        period_secs = period.as_secs(),
        "Starting periodic routine"
    );

    let period = if period < MIN_PERIOD {
        warn!(
            routine = routine.name(),
            period_ms = period.as_millis() as u64,
            "Routine period too short, using minimum"
        );
        MIN_PERIOD
    } else {
        period
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut runs = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!(routine = routine.name(), runs, "Stopping periodic routine");
                break;
            }
            _ = ticker.tick() => {
                routine.run_once().await;
                runs += 1;
                debug!(routine = routine.name(), runs, "Routine run complete");
            }
        }
    }
    routine
}
