//! Background worker that drives orders through the accrual provider.
//!
//! Each cycle takes a batch of pending orders from the [`OrderStore`], asks
//! the [`AccrualClient`] about each of them with bounded concurrency and
//! applies the answers. No store lock is held while a query is in flight.
//!
//! A 429 from the provider pauses the whole poller, not just one order,
//! until the advertised `Retry-After` has elapsed.
//!
//! An order that is still pending after its query sits out the next
//! selections for `retry_backoff`, so the batch moves on to newer orders.
//! An order whose stored state turns out inconsistent is never selected
//! again by this poller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use accrual::{AccrualClient, AccrualError, AccrualReport, AccrualStatus};
use futures::stream::{self, StreamExt};
use model::{Order, OrderUpdate, Transition};
use service::{OrderStore, ServiceError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tuning knobs of the poller.
#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Pause between two cycles when no new order arrives.
    pub interval: Duration,
    /// Maximum number of orders picked up per cycle.
    pub batch_size: usize,
    /// Maximum number of provider queries in flight.
    pub concurrency: usize,
    /// How long an order still pending after a query waits before the next one.
    pub retry_backoff: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            concurrency: 8,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Orders taken from the store.
    pub selected: usize,
    /// Orders whose status moved forward.
    pub advanced: usize,
    /// Orders queried but left as they were.
    pub unchanged: usize,
    /// Orders whose query or update failed.
    pub failed: usize,
    /// Orders not queried because the provider asked us to back off.
    pub skipped: usize,
}

enum Outcome {
    Advanced,
    Unchanged,
    Failed,
    Skipped,
}

/// Polls the accrual provider for pending orders.
pub struct AccrualPoller {
    client: Arc<dyn AccrualClient>,
    orders: OrderStore,
    settings: PollerSettings,
    paused_until: Mutex<Option<Instant>>,
    /// Next allowed query per order number.
    deferred: Mutex<HashMap<String, Instant>>,
    quarantined: Mutex<HashSet<String>>,
}

/// Handle to a poller started with [`AccrualPoller::start`].
pub struct PollerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancels the poller and waits for its task to finish.
    ///
    /// A cycle in progress is abandoned; orders whose update was not
    /// committed keep their previous state and are picked up again later.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.token.cancel();
        self.handle.await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl AccrualPoller {
    pub fn new(client: Arc<dyn AccrualClient>, orders: OrderStore, settings: PollerSettings) -> Self {
        Self {
            client,
            orders,
            settings: PollerSettings {
                batch_size: settings.batch_size.max(1),
                concurrency: settings.concurrency.max(1),
                ..settings
            },
            paused_until: Mutex::new(None),
            deferred: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns [`AccrualPoller::run`] on the current runtime.
    ///
    /// The poller stops when `shutdown` is cancelled or when
    /// [`PollerHandle::stop`] is called.
    pub fn start(self: Arc<Self>, shutdown: &CancellationToken) -> PollerHandle {
        let token = shutdown.child_token();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { self.run(run_token).await });
        PollerHandle { token, handle }
    }

    /// Runs cycles until `shutdown` is cancelled.
    ///
    /// A new cycle starts after `interval`, or earlier when the order store
    /// reports a new upload.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval = ?self.settings.interval,
            batch_size = self.settings.batch_size,
            concurrency = self.settings.concurrency,
            retry_backoff = ?self.settings.retry_backoff,
            "Accrual poller started"
        );
        let wakeup = self.orders.pending_signal();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                stats = self.poll_once() => {
                    if stats.selected > 0 {
                        debug!(?stats, "Accrual cycle finished");
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.next_delay()) => {}
                _ = wakeup.notified() => {}
            }
        }

        info!("Accrual poller stopped");
    }

    /// Runs a single cycle over up to `batch_size` pending orders.
    ///
    /// Deferred and quarantined orders are left out of the selection.
    pub async fn poll_once(&self) -> CycleStats {
        if let Some(remaining) = self.pause_remaining() {
            debug!(?remaining, "Accrual queries paused");
            return CycleStats::default();
        }

        let exclude = self.excluded();
        let pending = match self.orders.pending(self.settings.batch_size, &exclude).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to load pending orders: {e}");
                return CycleStats::default();
            }
        };

        let mut stats = CycleStats {
            selected: pending.len(),
            ..CycleStats::default()
        };
        let mut outcomes = stream::iter(pending)
            .map(|order| self.process(order))
            .buffer_unordered(self.settings.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Outcome::Advanced => stats.advanced += 1,
                Outcome::Unchanged => stats.unchanged += 1,
                Outcome::Failed => stats.failed += 1,
                Outcome::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    async fn process(&self, order: Order) -> Outcome {
        if self.pause_remaining().is_some() {
            return Outcome::Skipped;
        }

        let report = match self.client.query(&order.number).await {
            Ok(report) => report,
            Err(AccrualError::RateLimited { retry_after }) => {
                warn!(order = %order.number, ?retry_after, "Accrual service rate limit hit, pausing");
                self.pause_for(retry_after);
                return Outcome::Skipped;
            }
            Err(AccrualError::NotRegistered) => {
                debug!(order = %order.number, "Order not registered in accrual service yet");
                self.defer(&order.number);
                return Outcome::Unchanged;
            }
            Err(e) => {
                warn!(order = %order.number, "Accrual query failed: {e}");
                self.defer(&order.number);
                return Outcome::Failed;
            }
        };

        match self
            .orders
            .apply_accrual_result(&order.number, update_for(&report))
            .await
        {
            Ok(Transition::Advanced { to, .. }) => {
                if to.is_pending() {
                    self.defer(&order.number);
                }
                Outcome::Advanced
            }
            Ok(_) => {
                self.defer(&order.number);
                Outcome::Unchanged
            }
            // already logged by the order store
            Err(ServiceError::InternalInconsistency(_)) => {
                self.quarantine(&order.number);
                Outcome::Failed
            }
            Err(e) => {
                error!(order = %order.number, "Failed to apply accrual result: {e}");
                Outcome::Failed
            }
        }
    }

    fn defer(&self, number: &str) {
        let until = Instant::now() + self.settings.retry_backoff;
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(number.to_string(), until);
    }

    fn quarantine(&self, number: &str) {
        let inserted = self
            .quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(number.to_string());
        if inserted {
            warn!(order = number, "Order excluded from accrual polling");
        }
    }

    /// Numbers that must not be selected in this cycle.
    fn excluded(&self) -> Vec<String> {
        let now = Instant::now();
        let mut deferred = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        deferred.retain(|_, until| *until > now);
        let mut exclude: Vec<String> = deferred.keys().cloned().collect();
        drop(deferred);

        exclude.extend(
            self.quarantined
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        exclude
    }

    fn pause_for(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut paused = self
            .paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // concurrent 429s only ever extend the pause
        if paused.is_none_or(|current| current < until) {
            *paused = Some(until);
        }
    }

    fn pause_remaining(&self) -> Option<Duration> {
        let mut paused = self
            .paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *paused {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            Some(_) => {
                *paused = None;
                None
            }
            None => None,
        }
    }

    fn next_delay(&self) -> Duration {
        self.pause_remaining()
            .map_or(self.settings.interval, |remaining| {
                remaining.max(self.settings.interval)
            })
    }
}

/// Translates a provider report into the order update it implies.
pub fn update_for(report: &AccrualReport) -> OrderUpdate {
    match report.status {
        AccrualStatus::Registered | AccrualStatus::Processing => OrderUpdate::Processing,
        AccrualStatus::Processed => OrderUpdate::Processed {
            accrual: report.accrual.unwrap_or(0),
        },
        AccrualStatus::Invalid => OrderUpdate::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: AccrualStatus, accrual: Option<u64>) -> AccrualReport {
        AccrualReport {
            order: "9278923470".into(),
            status,
            accrual,
        }
    }

    #[test]
    fn test_update_for_report() {
        assert_eq!(
            update_for(&report(AccrualStatus::Registered, None)),
            OrderUpdate::Processing
        );
        assert_eq!(
            update_for(&report(AccrualStatus::Processing, None)),
            OrderUpdate::Processing
        );
        assert_eq!(
            update_for(&report(AccrualStatus::Processed, Some(500))),
            OrderUpdate::Processed { accrual: 500 }
        );
        assert_eq!(
            update_for(&report(AccrualStatus::Processed, None)),
            OrderUpdate::Processed { accrual: 0 }
        );
        assert_eq!(
            update_for(&report(AccrualStatus::Invalid, Some(10))),
            OrderUpdate::Invalid
        );
    }
}
