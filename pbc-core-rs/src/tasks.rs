//! Periodic task runner

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Random delay in `[0, max]`, spreads out nodes started together
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=max)
}

/// Run `tick` every `period`, first after `first_in`, until `shutdown`
/// turns true or its sender is dropped.
///
/// Ticks never overlap: a slow tick delays the next one rather than
/// bursting to catch up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    first_in: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + first_in, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Tasks: {} every {:?}", name, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Tasks: {} stopped", name);
    })
}
