// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Scan strategies of the rate decoupler.

use crate::{Error, Event, RateDecoupler, lock};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::sync::{Arc, Mutex};

/// Scan modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    /// Event driven, coalescing.
    #[default]
    Passive,
    /// Periodic sampling.
    Active,
}

/// Hooks through which a strategy decides when desired-rate events are
/// emitted.
///
/// Every hook is called by the decoupler after its own lifecycle state has
/// been updated and without any decoupler lock held.
pub trait ScanStrategy: Send + Sync + 'static {
    /// Called once on start.
    fn on_start(&self, _decoupler: &RateDecoupler) {}

    /// Called once on stop.
    fn on_stop(&self, decoupler: &RateDecoupler) -> Result<(), Error>;

    /// Called on pause.
    fn on_pause(&self, _decoupler: &RateDecoupler) {}

    /// Called on resume.
    fn on_resume(&self, _decoupler: &RateDecoupler) {}

    /// A source-rate event arrived.
    fn new_event(&self, decoupler: &RateDecoupler, event: Event);

    /// The downstream consumer is done with the last desired-rate event.
    fn on_desired_event_processed(&self, _decoupler: &RateDecoupler) {}

    /// A scheduled scan fired.
    fn scan(&self, decoupler: &RateDecoupler);
}

#[derive(Debug, Default)]
struct PassiveState {
    queued: Option<Event>,
    scan_active: bool,
    last_submission: Option<Instant>,
}

/// Coalescing, event driven strategy.
///
/// Every source event is merged into one queued event. A scan is scheduled
/// when none is active: right away if the maximum duration already elapsed
/// since the previous emission, otherwise at `last + max_duration`.
#[derive(Debug, Default)]
pub struct PassiveScan {
    state: Mutex<PassiveState>,
}

impl PassiveScan {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule_scan(&self, decoupler: &RateDecoupler, state: &mut PassiveState) {
        state.scan_active = true;
        let delay = state
            .last_submission
            .map(|last| decoupler.max_duration().saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO);
        let target = decoupler.clone();
        decoupler
            .scheduler()
            .schedule(delay, Box::new(move || target.run_scan()));
    }

    /// Reschedules if something is pending and nothing else is going on.
    fn reschedule(&self, decoupler: &RateDecoupler) {
        let mut state = lock(&self.state);
        if state.queued.is_some()
            && !state.scan_active
            && decoupler.is_started()
            && !decoupler.is_paused()
            && !decoupler.is_stopped()
            && !decoupler.is_event_processing()
        {
            self.schedule_scan(decoupler, &mut state);
        }
    }
}

impl ScanStrategy for PassiveScan {
    fn on_start(&self, decoupler: &RateDecoupler) {
        self.reschedule(decoupler);
    }

    fn on_stop(&self, _decoupler: &RateDecoupler) -> Result<(), Error> {
        lock(&self.state).queued = None;
        Ok(())
    }

    fn on_resume(&self, decoupler: &RateDecoupler) {
        self.reschedule(decoupler);
    }

    fn new_event(&self, decoupler: &RateDecoupler, event: Event) {
        if decoupler.is_stopped() {
            return;
        }
        let mut state = lock(&self.state);
        let queued = match state.queued.take() {
            Some(queued) => queued.merge(&event),
            None => event,
        };
        state.queued = Some(queued);
        if !state.scan_active && decoupler.is_started() && !decoupler.is_paused()
        {
            self.schedule_scan(decoupler, &mut state);
        }
    }

    fn on_desired_event_processed(&self, decoupler: &RateDecoupler) {
        let mut state = lock(&self.state);
        if state.queued.is_some()
            && !decoupler.is_paused()
            && !decoupler.is_stopped()
        {
            self.schedule_scan(decoupler, &mut state);
        } else {
            state.scan_active = false;
        }
    }

    fn scan(&self, decoupler: &RateDecoupler) {
        let event = {
            let mut state = lock(&self.state);
            if decoupler.is_stopped() {
                state.queued = None;
                state.scan_active = false;
                return;
            }
            // Left queued for resume.
            if decoupler.is_paused() {
                state.scan_active = false;
                return;
            }
            match state.queued.take() {
                Some(event) => {
                    state.last_submission = Some(Instant::now());
                    event
                }
                None => {
                    state.scan_active = false;
                    return;
                }
            }
        };
        if decoupler.send_desired_rate_event(event).is_err() {
            lock(&self.state).scan_active = false;
        }
    }
}

/// Periodic sampling strategy.
///
/// Samples every `max_duration`, first tick immediately, emitting a
/// `ReadConnection + Value` event whether or not the source changed. Ticks
/// that find an event in flight or the decoupler paused are skipped.
#[derive(Debug, Default)]
pub struct ActiveScan {
    token: Mutex<Option<CancellationToken>>,
}

impl ActiveScan {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanStrategy for ActiveScan {
    fn on_start(&self, decoupler: &RateDecoupler) {
        let token = CancellationToken::new();
        *lock(&self.token) = Some(token.clone());
        let target = decoupler.clone();
        decoupler.scheduler().repeat(
            decoupler.max_duration(),
            token,
            Arc::new(move || target.run_scan()),
        );
        debug!("Active scan started every {:?}.", decoupler.max_duration());
    }

    fn on_stop(&self, _decoupler: &RateDecoupler) -> Result<(), Error> {
        match lock(&self.token).take() {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                error!("Active scan stopped before it was started!");
                Err(Error::Protocol(
                    "active scan stopped before it was started".to_owned(),
                ))
            }
        }
    }

    fn new_event(&self, _decoupler: &RateDecoupler, _event: Event) {}

    fn scan(&self, decoupler: &RateDecoupler) {
        if decoupler.is_stopped()
            || decoupler.is_paused()
            || decoupler.is_event_processing()
        {
            return;
        }
        if let Err(error) =
            decoupler.send_desired_rate_event(Event::read_connection_and_value())
        {
            debug!("Active scan tick dropped: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{EventKind, executor::Scheduler};

    use tracing_test::traced_test;

    /// Downstream listener recording the emission instant and signalling
    /// ready right away.
    fn inline_consumer(
        decoupler_slot: Arc<Mutex<Option<RateDecoupler>>>,
        sink: Arc<Mutex<Vec<(Instant, Event)>>>,
    ) -> crate::DesiredRateListener {
        Arc::new(move |event| {
            sink.lock().unwrap().push((Instant::now(), event));
            let decoupler = decoupler_slot.lock().unwrap().clone();
            if let Some(decoupler) = decoupler {
                decoupler.ready_for_next_event();
            }
        })
    }

    fn decoupler(
        mode: ScanMode,
        max: Duration,
    ) -> (RateDecoupler, Arc<Mutex<Vec<(Instant, Event)>>>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::new(Mutex::new(Vec::new()));
        let decoupler = RateDecoupler::new(
            mode,
            max,
            Scheduler::current().unwrap(),
            inline_consumer(slot.clone(), sink.clone()),
            None,
        );
        *slot.lock().unwrap() = Some(decoupler.clone());
        (decoupler, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_coalesces_burst() {
        let (decoupler, sink) =
            decoupler(ScanMode::Passive, Duration::from_millis(100));
        decoupler.start();
        let update = decoupler.update_listener();

        // First event goes out on the next scan.
        update(Event::value());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);

        // A burst inside the window is merged into a single emission.
        update(Event::read_connection());
        update(Event::value());
        update(Event::exception(Error::Read("late".to_owned())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 2);
        let merged = &sink[1].1;
        assert!(merged.is_kind(EventKind::ReadConnection));
        assert!(merged.is_kind(EventKind::Value));
        assert!(merged.is_kind(EventKind::Exception));
        assert_eq!(merged.error(), Some(&Error::Read("late".to_owned())));
        assert!(sink[1].0 - sink[0].0 >= Duration::from_millis(100));
        decoupler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_rate_bound() {
        let max = Duration::from_millis(50);
        let (decoupler, sink) = decoupler(ScanMode::Passive, max);
        decoupler.start();
        let update = decoupler.update_listener();
        for _ in 0..200 {
            update(Event::value());
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sink = sink.lock().unwrap();
        assert!(sink.len() >= 10);
        for pair in sink.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= max);
        }
        decoupler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_pause_keeps_queue() {
        let (decoupler, sink) =
            decoupler(ScanMode::Passive, Duration::from_millis(100));
        decoupler.start();
        let update = decoupler.update_listener();
        update(Event::value());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);

        decoupler.pause();
        for _ in 0..10 {
            update(Event::value());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);

        decoupler.resume();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].1, Event::value());
        decoupler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_resume_without_queue_schedules_nothing() {
        let (decoupler, sink) =
            decoupler(ScanMode::Passive, Duration::from_millis(10));
        decoupler.start();
        decoupler.pause();
        decoupler.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.lock().unwrap().is_empty());
        decoupler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_stop_drops_queue() {
        let (decoupler, sink) =
            decoupler(ScanMode::Passive, Duration::from_millis(100));
        decoupler.start();
        let update = decoupler.update_listener();
        update(Event::value());
        tokio::time::sleep(Duration::from_millis(1)).await;
        update(Event::value());
        decoupler.stop().unwrap();
        update(Event::value());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_waits_for_start() {
        let (decoupler, sink) =
            decoupler(ScanMode::Passive, Duration::from_millis(10));
        let update = decoupler.update_listener();
        update(Event::read_connection_and_value());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.lock().unwrap().is_empty());
        decoupler.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);
        decoupler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_samples_periodically() {
        let (decoupler, sink) =
            decoupler(ScanMode::Active, Duration::from_millis(100));
        decoupler.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        {
            let sink = sink.lock().unwrap();
            // Ticks at 0, 100, 200 and 300 ms.
            assert_eq!(sink.len(), 4);
            assert!(
                sink.iter()
                    .all(|(_, event)| *event == Event::read_connection_and_value())
            );
        }
        decoupler.pause();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.lock().unwrap().len(), 4);
        decoupler.stop().unwrap();
        decoupler.resume();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_active_skips_while_in_flight() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let inner = sink.clone();
        // Never signals ready.
        let decoupler = RateDecoupler::new(
            ScanMode::Active,
            Duration::from_millis(10),
            Scheduler::current().unwrap(),
            Arc::new(move |event| inner.lock().unwrap().push(event)),
            None,
        );
        decoupler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.lock().unwrap().len(), 1);

        // An extra tick on the busy decoupler is skipped quietly.
        ActiveScan::new().scan(&decoupler);
        assert_eq!(sink.lock().unwrap().len(), 1);
        assert!(!logs_contain("still in flight"));
        decoupler.stop().unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_active_stop_without_start() {
        let (decoupler, _) =
            decoupler(ScanMode::Active, Duration::from_millis(10));
        let result = decoupler.stop();
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(logs_contain("stopped before it was started"));
    }
}
