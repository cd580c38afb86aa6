//! Budget/cost governor.
//!
//! One mutex-guarded ledger is the single coordination point for observed
//! cost, in-flight attempts and elapsed time. Each attempt asks for clearance
//! before it starts and settles its observed cost when it ends. Once the
//! observed cost exceeds `budget_cap * kill_threshold` (or elapsed time
//! exceeds the time cap) the governor trips: the cancellation signal fires,
//! no further clearance is granted, and the run seals as BudgetExceeded.
//!
//! Near the limit dispatch serializes: an attempt whose estimate would push
//! the projection (observed + in-flight estimates + its own) over the limit
//! waits until the in-flight attempts settle. With nothing in flight it runs,
//! so the overrun past the limit is bounded by one attempt's cost.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mrp_core::id::ShardId;
use mrp_core::record::{BudgetResource, RunFailure};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Prices attempts. `estimate` gates dispatch; `observe` is what gets charged.
pub trait CostMeter: Send + Sync + 'static {
    fn estimate(&self, shard: ShardId) -> f64;
    fn observe(&self, shard: ShardId, attempt: u32, elapsed: Duration) -> f64;
}

/// Charges a fixed weight per attempt (the Map operator's cost-model weight).
#[derive(Debug, Clone, Copy)]
pub struct WeightMeter {
    pub weight: f64,
}

impl CostMeter for WeightMeter {
    fn estimate(&self, _shard: ShardId) -> f64 {
        self.weight
    }

    fn observe(&self, _shard: ShardId, _attempt: u32, _elapsed: Duration) -> f64 {
        self.weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetTrip {
    pub resource: BudgetResource,
    pub observed: f64,
    pub limit: f64,
}

impl From<BudgetTrip> for RunFailure {
    fn from(t: BudgetTrip) -> Self {
        RunFailure::BudgetExceeded {
            resource: t.resource,
            observed: t.observed,
            limit: t.limit,
        }
    }
}

/// Receiving side of the run-wide cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    observed: f64,
    in_flight: usize,
    in_flight_estimate: f64,
    peak: usize,
    attempts: u32,
    trip: Option<BudgetTrip>,
    aborted: bool,
}

impl Ledger {
    fn halted(&self) -> bool {
        self.trip.is_some() || self.aborted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorSnapshot {
    pub observed: f64,
    pub limit: f64,
    pub attempts: u32,
    pub peak_concurrency: usize,
    pub elapsed: Duration,
    pub trip: Option<BudgetTrip>,
}

#[derive(Debug)]
pub struct Governor {
    limit: f64,
    time_limit: Option<Duration>,
    started: Instant,
    ledger: Mutex<Ledger>,
    settled: Notify,
    cancel: watch::Sender<bool>,
}

impl Governor {
    pub fn new(limit: f64, time_limit: Option<Duration>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            limit,
            time_limit,
            started: Instant::now(),
            ledger: Mutex::new(Ledger::default()),
            settled: Notify::new(),
            cancel,
        }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.cancel.subscribe())
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn breach(&self, ledger: &Ledger) -> Option<BudgetTrip> {
        if ledger.observed > self.limit {
            return Some(BudgetTrip {
                resource: BudgetResource::Cost,
                observed: ledger.observed,
                limit: self.limit,
            });
        }
        let limit = self.time_limit?;
        let elapsed = self.started.elapsed();
        (elapsed > limit).then(|| BudgetTrip {
            resource: BudgetResource::Time,
            observed: elapsed.as_secs_f64(),
            limit: limit.as_secs_f64(),
        })
    }

    /// Record a trip (first one wins) and fire the cancellation signal.
    fn trip(&self, ledger: &mut Ledger, trip: BudgetTrip) -> Option<BudgetTrip> {
        if ledger.trip.is_some() {
            return None;
        }
        warn!(
            resource = ?trip.resource,
            observed = trip.observed,
            limit = trip.limit,
            in_flight = ledger.in_flight,
            "budget governor tripped; cancelling run"
        );
        ledger.trip = Some(trip);
        self.cancel.send_replace(true);
        Some(trip)
    }

    /// Wait until an attempt estimated at `estimate` may start. Returns
    /// `false` once the run has been tripped or aborted.
    pub async fn clearance(&self, estimate: f64) -> bool {
        let mut cancel = self.signal();
        loop {
            let settled = self.settled.notified();
            {
                let mut ledger = self.lock();
                if ledger.halted() {
                    return false;
                }
                if let Some(trip) = self.breach(&ledger) {
                    self.trip(&mut ledger, trip);
                    return false;
                }
                let projected = ledger.observed + ledger.in_flight_estimate + estimate;
                if ledger.in_flight == 0 || projected <= self.limit {
                    ledger.in_flight += 1;
                    ledger.in_flight_estimate += estimate;
                    ledger.attempts += 1;
                    ledger.peak = ledger.peak.max(ledger.in_flight);
                    return true;
                }
                debug!(
                    projected,
                    limit = self.limit,
                    in_flight = ledger.in_flight,
                    "near budget limit; waiting for in-flight attempts"
                );
            }
            tokio::select! {
                _ = settled => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Resolves once the time cap passes, tripping the governor unless the
    /// run already stopped. Never resolves without a time cap.
    pub async fn deadline(&self) {
        let Some(limit) = self.time_limit else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(tokio::time::Instant::from_std(self.started + limit)).await;
        let mut ledger = self.lock();
        if !ledger.halted() {
            let trip = BudgetTrip {
                resource: BudgetResource::Time,
                observed: self.started.elapsed().as_secs_f64(),
                limit: limit.as_secs_f64(),
            };
            self.trip(&mut ledger, trip);
        }
        drop(ledger);
        self.settled.notify_waiters();
    }

    /// Close out a cleared attempt. Returns the trip if this charge caused it.
    pub fn settle(&self, estimate: f64, observed: f64) -> Option<BudgetTrip> {
        let tripped = {
            let mut ledger = self.lock();
            ledger.in_flight = ledger.in_flight.saturating_sub(1);
            ledger.in_flight_estimate = (ledger.in_flight_estimate - estimate).max(0.0);
            ledger.observed += observed;
            match self.breach(&ledger) {
                Some(trip) => self.trip(&mut ledger, trip),
                None => None,
            }
        };
        self.settled.notify_waiters();
        tripped
    }

    /// Charge work that ran outside Map dispatch (Reduce, Produce).
    pub fn charge(&self, observed: f64) -> Option<BudgetTrip> {
        let mut ledger = self.lock();
        ledger.observed += observed;
        match self.breach(&ledger) {
            Some(trip) => self.trip(&mut ledger, trip),
            None => None,
        }
    }

    /// Stop the run for a reason other than budget (permanent shard failure).
    pub fn abort(&self) {
        {
            let mut ledger = self.lock();
            ledger.aborted = true;
        }
        self.cancel.send_replace(true);
        self.settled.notify_waiters();
    }

    pub fn tripped(&self) -> Option<BudgetTrip> {
        self.lock().trip
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let ledger = self.lock();
        GovernorSnapshot {
            observed: ledger.observed,
            limit: self.limit,
            attempts: ledger.attempts,
            peak_concurrency: ledger.peak,
            elapsed: self.started.elapsed(),
            trip: ledger.trip,
        }
    }
}
