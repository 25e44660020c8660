//! Rate-adaptive enrichment pipeline.
//!
//! Three perpetual loops share one `PipelineState`: discovery feeds the queue,
//! drain dispatches at most one lookup at a time through the rate controller,
//! and sweep evicts stale entries and publishes diagnostics. All loops run in
//! one cooperative task; state is only borrowed between suspension points.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Notify};

use crate::clock::PipelineClock;
use crate::config::{Config, UnknownPolicy};
use crate::dom_projector::DomProjector;
use crate::enrichment_cache::EnrichmentCache;
use crate::enrichment_queue::EnrichmentQueue;
use crate::error::FetchError;
use crate::label_resolver::LabelResolver;
use crate::lookup::ProfileFetcher;
use crate::protocol::{DiagnosticsSnapshot, EnrichmentResult, Handle, QueueEntry};
use crate::rate_controller::{ceil_seconds, DispatchQuota, RateController};
use crate::result_store::ResultStore;
use crate::timeline::{Discovery, RenderTarget};

/// Running totals reported through diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub lookups_dispatched: u64,
    pub lookups_rejected: u64,
    pub lookups_failed: u64,
    pub stale_evictions: u64,
}

/// Everything the loops share. Created on pipeline start, dropped on teardown.
pub struct PipelineState {
    pub cache: EnrichmentCache,
    pub queue: EnrichmentQueue,
    pub rate: RateController,
    /// Handle whose lookup is currently awaiting the remote service.
    pub in_flight: Option<Handle>,
    pub counters: PipelineCounters,
}

/// Cadence and policy knobs resolved from `Config`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub discovery_interval: Duration,
    pub drain_interval: Duration,
    pub drain_jitter: Duration,
    pub sweep_interval: Duration,
    pub clear_queue_on_rejection: bool,
    pub unknown_policy: UnknownPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            discovery_interval: Duration::from_millis(config.pipeline.discovery_interval_ms),
            drain_interval: Duration::from_millis(config.pipeline.drain_interval_ms),
            drain_jitter: Duration::from_millis(config.pipeline.drain_jitter_ms),
            sweep_interval: Duration::from_millis(config.pipeline.sweep_interval_ms),
            clear_queue_on_rejection: config.pipeline.clear_queue_on_rejection,
            unknown_policy: config.pipeline.unknown_policy,
        }
    }
}

/// Collaborators wired into a pipeline.
pub struct PipelineParts<F, D, R> {
    pub fetcher: F,
    pub discovery: Rc<D>,
    pub render: Rc<R>,
    pub store: ResultStore,
    pub clock: PipelineClock,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub projected: usize,
    pub promoted: usize,
    pub enqueued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing queued.
    Idle,
    /// Global circuit breaker is open; the queue was left untouched.
    Paused,
    /// Every queued handle is still backing off.
    Deferred,
    /// Dispatch quota exhausted; the handle went back to the front.
    QuotaDeferred(Handle),
    Resolved { handle: Handle, label: String },
    /// Lookup succeeded without a usable label.
    Unknown(Handle),
    /// Remote service signalled a rate limit.
    Rejected(Handle),
    /// Transport or decode failure; treated as unknown for this attempt.
    Failed(Handle),
}

/// Stop conditions shared by the loops.
#[derive(Debug, Clone)]
pub struct LoopControl {
    shutdown: watch::Receiver<bool>,
    shutdown_open: bool,
    max_iterations: Option<u64>,
}

impl LoopControl {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            shutdown_open: true,
            max_iterations: None,
        }
    }

    #[cfg(test)]
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn should_stop(&self, iteration: u64) -> bool {
        self.is_shutdown() || self.max_iterations.is_some_and(|max| iteration >= max)
    }

    /// Waits for `delay` or an optional wake signal. Returns `false` on shutdown.
    async fn pause(&mut self, delay: Duration, wake: Option<&Notify>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return !self.is_shutdown(),
                _ = wait_for_signal(wake) => return !self.is_shutdown(),
                changed = self.shutdown.changed(), if self.shutdown_open => {
                    if changed.is_err() {
                        self.shutdown_open = false;
                    } else if self.is_shutdown() {
                        return false;
                    }
                }
            }
        }
    }
}

async fn wait_for_signal(signal: Option<&Notify>) {
    match signal {
        Some(notify) => notify.notified().await,
        None => std::future::pending::<()>().await,
    }
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return base;
    }
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return base;
    }
    base + Duration::from_millis(u64::from_le_bytes(bytes) % (jitter_ms + 1))
}

enum DiscoveryStep {
    Project(String),
    Skip,
    Lookup,
}

pub struct Pipeline<F, D, R: RenderTarget> {
    state: RefCell<PipelineState>,
    store: ResultStore,
    fetcher: F,
    discovery: Rc<D>,
    projector: DomProjector<R>,
    resolver: LabelResolver,
    quota: DispatchQuota,
    clock: PipelineClock,
    settings: PipelineSettings,
    diagnostics_tx: watch::Sender<DiagnosticsSnapshot>,
}

impl<F, D, R> Pipeline<F, D, R>
where
    F: ProfileFetcher,
    D: Discovery,
    R: RenderTarget,
{
    pub fn new(config: &Config, parts: PipelineParts<F, D, R>) -> Self {
        let PipelineParts {
            fetcher,
            discovery,
            render,
            store,
            clock,
        } = parts;
        let state = PipelineState {
            cache: EnrichmentCache::new(),
            queue: EnrichmentQueue::new(
                i64::try_from(config.pipeline.staleness_ms).unwrap_or(i64::MAX),
                config.pipeline.max_pending,
            ),
            rate: RateController::new(
                &config.rate.backoff_sequence(),
                Duration::from_secs(config.rate.global_cooldown_secs),
            ),
            in_flight: None,
            counters: PipelineCounters::default(),
        };
        let (diagnostics_tx, _) = watch::channel(DiagnosticsSnapshot::default());
        Self {
            state: RefCell::new(state),
            store,
            fetcher,
            discovery,
            projector: DomProjector::new(render),
            resolver: LabelResolver::new(config.labels.style),
            quota: DispatchQuota::new(
                config.rate.dispatch_quota_requests,
                Duration::from_secs(config.rate.dispatch_quota_window_secs),
            ),
            clock,
            settings: PipelineSettings::from_config(config),
            diagnostics_tx,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> std::cell::Ref<'_, PipelineState> {
        self.state.borrow()
    }

    pub fn subscribe_diagnostics(&self) -> watch::Receiver<DiagnosticsSnapshot> {
        self.diagnostics_tx.subscribe()
    }

    fn discovery_step(&self, handle: &str) -> DiscoveryStep {
        let state = self.state.borrow();
        if let Some(result) = state.cache.get(handle) {
            return DiscoveryStep::Project(result.label.clone());
        }
        if state.cache.is_known_unknown(handle)
            || state.queue.contains(handle)
            || state.in_flight.as_deref() == Some(handle)
        {
            return DiscoveryStep::Skip;
        }
        DiscoveryStep::Lookup
    }

    /// One discovery pass: project what is known, promote stored results,
    /// and queue the rest unless the circuit breaker is open.
    pub async fn discovery_pass(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut handles: Vec<Handle> = self.discovery.discover().into_iter().collect();
        handles.sort();

        // A stale entry counts as absent, so it must not shadow rediscovery.
        {
            let mut state = self.state.borrow_mut();
            let evicted = state.queue.evict_stale(self.clock.now_unix_ms());
            state.counters.stale_evictions += evicted as u64;
        }

        for handle in handles {
            match self.discovery_step(&handle) {
                DiscoveryStep::Project(label) => {
                    if self.projector.project(&handle, &label) > 0 {
                        report.projected += 1;
                    }
                    continue;
                }
                DiscoveryStep::Skip => continue,
                DiscoveryStep::Lookup => {}
            }

            let now = self.clock.now_unix_ms();
            match self.store.load(&handle, now).await {
                Ok(Some(stored)) if stored.is_valid() => {
                    let label = stored.label.clone();
                    self.state.borrow_mut().cache.put(handle.clone(), stored);
                    debug!("Enrichment[@{}]: promoted stored label '{}'", handle, label);
                    self.projector.project(&handle, &label);
                    report.promoted += 1;
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!("Enrichment[@{}]: result store read failed: {}", handle, error);
                }
            }

            let now = self.clock.now_unix_ms();
            let mut state = self.state.borrow_mut();
            if state.rate.is_globally_paused(now) {
                continue;
            }
            // The drain loop may have resolved or claimed the handle during the store read.
            if state.cache.get(&handle).is_some() || state.in_flight.as_deref() == Some(&handle) {
                continue;
            }
            if state.queue.enqueue(&handle, now) {
                debug!("Enrichment[@{}]: queued for lookup", handle);
                report.enqueued += 1;
            }
        }
        report
    }

    fn take_admissible(&self, now: i64) -> Result<QueueEntry, DrainOutcome> {
        let mut state = self.state.borrow_mut();
        if state.queue.is_empty() {
            return Err(DrainOutcome::Idle);
        }
        if state.rate.is_globally_paused(now) {
            return Err(DrainOutcome::Paused);
        }

        let mut deferred = Vec::new();
        let mut picked = None;
        for _ in 0..state.queue.size() {
            let Some(entry) = state.queue.dequeue_next(now) else {
                break;
            };
            if state.rate.admit(&entry.handle, now) {
                picked = Some(entry);
                break;
            }
            deferred.push(entry);
        }
        for entry in deferred {
            state.queue.requeue_back(entry);
        }

        let entry = match picked {
            Some(entry) => entry,
            None if state.queue.is_empty() => return Err(DrainOutcome::Idle),
            None => return Err(DrainOutcome::Deferred),
        };
        if !self.quota.try_acquire() {
            debug!("Enrichment[@{}]: dispatch quota exhausted, deferring", entry.handle);
            state.queue.enqueue_front(&entry.handle, entry.enqueued_at);
            return Err(DrainOutcome::QuotaDeferred(entry.handle));
        }
        state.in_flight = Some(entry.handle.clone());
        state.counters.lookups_dispatched += 1;
        Ok(entry)
    }

    /// One drain cycle: dispatch at most one admitted lookup and apply its outcome.
    pub async fn drain_once(&self) -> DrainOutcome {
        let entry = match self.take_admissible(self.clock.now_unix_ms()) {
            Ok(entry) => entry,
            Err(outcome) => return outcome,
        };
        let handle = entry.handle;
        debug!("Enrichment[@{}]: dispatching lookup", handle);

        let fetched = self.fetcher.fetch_location(&handle).await;
        let now = self.clock.now_unix_ms();
        self.state.borrow_mut().in_flight = None;

        match fetched {
            Ok(location) => {
                if location.handle != handle {
                    debug!(
                        "Enrichment[@{}]: remote reports canonical handle @{}",
                        handle, location.handle
                    );
                }
                let label = self.resolver.resolve(location.raw_location.as_deref());
                let result = EnrichmentResult::new(handle.clone(), label.clone(), now);
                {
                    let mut state = self.state.borrow_mut();
                    state.rate.on_succeeded(&handle);
                    if !result.is_valid() {
                        if self.settings.unknown_policy == UnknownPolicy::Suppress {
                            state.cache.remember_unknown(handle.clone());
                        }
                        debug!("Enrichment[@{}]: no usable region", handle);
                        return DrainOutcome::Unknown(handle);
                    }
                    state.cache.put(handle.clone(), result.clone());
                }
                if let Err(error) = self.store.save(&handle, &result).await {
                    warn!("Enrichment[@{}]: failed to persist result: {}", handle, error);
                }
                self.projector.project(&handle, &label);
                info!("Enrichment[@{}]: resolved '{}'", handle, label);
                DrainOutcome::Resolved { handle, label }
            }
            Err(FetchError::RateLimited) => {
                let mut state = self.state.borrow_mut();
                state.rate.on_rejected(&handle, now);
                state.counters.lookups_rejected += 1;
                let dropped = if self.settings.clear_queue_on_rejection {
                    state.queue.retain_only(&handle)
                } else {
                    0
                };
                state.queue.enqueue_front(&handle, now);
                let backoff_secs = state
                    .rate
                    .backoff_state(&handle)
                    .map(|backoff| ceil_seconds(backoff.backoff_until - now))
                    .unwrap_or(0);
                warn!(
                    "Enrichment[@{}]: rate limited; backing off {}s, pausing all lookups {}s, dropped {} queued",
                    handle,
                    backoff_secs,
                    ceil_seconds(state.rate.global_pause_remaining_ms(now)),
                    dropped
                );
                DrainOutcome::Rejected(handle)
            }
            Err(error) => {
                let mut state = self.state.borrow_mut();
                state.counters.lookups_failed += 1;
                if self.settings.unknown_policy == UnknownPolicy::Suppress {
                    state.cache.remember_unknown(handle.clone());
                }
                warn!("Enrichment[@{}]: lookup failed, treating as unknown: {}", handle, error);
                DrainOutcome::Failed(handle)
            }
        }
    }

    /// Evicts stale queue entries and publishes a diagnostics snapshot.
    pub async fn sweep_once(&self) -> DiagnosticsSnapshot {
        let now = self.clock.now_unix_ms();
        let mut snapshot = {
            let mut state = self.state.borrow_mut();
            let evicted = state.queue.evict_stale(now);
            if evicted > 0 {
                debug!("Evicted {} stale queue entries", evicted);
            }
            state.counters.stale_evictions += evicted as u64;
            DiagnosticsSnapshot {
                queue_depth: state.queue.size(),
                cache_entries: state.cache.len(),
                active_backoffs: state.rate.active_backoffs(now),
                global_pause_seconds_remaining: ceil_seconds(
                    state.rate.global_pause_remaining_ms(now),
                ),
                store_bytes: None,
                lookups_dispatched: state.counters.lookups_dispatched,
                lookups_rejected: state.counters.lookups_rejected,
                lookups_failed: state.counters.lookups_failed,
                stale_evictions: state.counters.stale_evictions,
            }
        };
        match self.store.size_estimate().await {
            Ok(bytes) => snapshot.store_bytes = Some(bytes),
            Err(error) => warn!("Failed to read result store size: {}", error),
        }
        self.diagnostics_tx.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn run_discovery_loop(&self, mut control: LoopControl) {
        let signal = self.discovery.change_signal();
        let mut iteration = 0;
        while !control.should_stop(iteration) {
            let report = self.discovery_pass().await;
            if report.enqueued > 0 || report.promoted > 0 {
                debug!(
                    "Discovery pass queued {} and promoted {} (projected {})",
                    report.enqueued, report.promoted, report.projected
                );
            }
            iteration += 1;
            if !control
                .pause(self.settings.discovery_interval, signal.as_deref())
                .await
            {
                break;
            }
        }
        debug!("Discovery loop stopped after {} passes", iteration);
    }

    pub async fn run_drain_loop(&self, mut control: LoopControl) {
        let mut iteration = 0;
        while !control.should_stop(iteration) {
            let delay = jittered(self.settings.drain_interval, self.settings.drain_jitter);
            if !control.pause(delay, None).await {
                break;
            }
            self.drain_once().await;
            iteration += 1;
        }
        debug!("Drain loop stopped after {} cycles", iteration);
    }

    pub async fn run_sweep_loop(&self, mut control: LoopControl) {
        let mut iteration = 0;
        while !control.should_stop(iteration) {
            if !control.pause(self.settings.sweep_interval, None).await {
                break;
            }
            self.sweep_once().await;
            iteration += 1;
        }
        debug!("Sweep loop stopped after {} sweeps", iteration);
    }

    /// Runs all three loops until `control` stops them.
    pub async fn run(&self, control: LoopControl) {
        info!("Enrichment pipeline started");
        tokio::join!(
            self.run_discovery_loop(control.clone()),
            self.run_drain_loop(control.clone()),
            self.run_sweep_loop(control),
        );
        let mut state = self.state.borrow_mut();
        state.cache.clear();
        let dropped = state.queue.clear();
        info!("Enrichment pipeline stopped; dropped {} queued lookups", dropped);
    }
}
