//! Rate-limited dispatcher: admits queued work to the external service.
//!
//! The dispatcher owns the admission window, the work list, and the limits.
//! Every mutation happens inside one lock acquisition, so two concurrent
//! dispatch passes can never both read the same free slot. Service calls run
//! as independent Tokio tasks; each completion re-runs admission.
//!
//! Admission is event-driven: enqueue, retry, removal, limit changes, and
//! completions all trigger [`Dispatcher::try_dispatch`]. [`Dispatcher::run`]
//! covers the one case with no triggering event, the rate window rolling over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{Instrument, Span, debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::limits::{Limits, available_slots};
use crate::model::{Outcome, Payload, Recognition, ServiceOutput, State, WorkId, WorkItem};
use crate::queue::JobQueue;
use crate::service::{RecognitionRequest, RecognitionService, RequestOptions};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};
use crate::window::AdmissionWindow;

/// Buffered events per subscriber before lagging receivers skip ahead.
const EVENT_CAPACITY: usize = 256;

/// Per-state counts plus admission headroom at the time of the last change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Service calls still outstanding, including calls for removed items.
    pub in_flight: usize,
    /// Admissions inside the trailing window.
    pub admitted_in_window: usize,
    pub available_slots: usize,
}

impl Status {
    /// Nothing queued and nothing in flight.
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

/// Live projection for display. Recomputed from the clock on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub seconds_until_next_slot: u64,
    pub available_slots: usize,
    pub queued: usize,
}

struct DispatchState {
    window: AdmissionWindow,
    queue: JobQueue,
    limits: Limits,
    in_flight: usize,
    event_seq: u64,
}

impl DispatchState {
    fn event(&mut self, kind: EventKind) -> Event {
        self.event_seq += 1;
        Event {
            seq: self.event_seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    fn slots(&self, now: Instant) -> usize {
        available_slots(
            &self.limits,
            self.in_flight,
            self.window.remaining(now),
            self.queue.count(State::Queued),
        )
    }

    fn status(&self, now: Instant) -> Status {
        Status {
            queued: self.queue.count(State::Queued),
            processing: self.queue.count(State::Processing),
            completed: self.queue.count(State::Completed),
            failed: self.queue.count(State::Failed),
            in_flight: self.in_flight,
            admitted_in_window: self.window.admitted(now),
            available_slots: self.slots(now),
        }
    }

    /// Why queued work is waiting, for the deferral metric.
    fn deferral_reason(&self, now: Instant) -> &'static str {
        if !self.limits.admits_anything() {
            "disabled"
        } else if self.window.remaining(now) == 0 {
            "rate_window"
        } else {
            "concurrency"
        }
    }
}

struct Shared<S, C> {
    service: S,
    clock: C,
    options: RequestOptions,
    state: Mutex<DispatchState>,
    events: broadcast::Sender<Event>,
    status: watch::Sender<Status>,
    shutdown: Notify,
}

/// The dispatcher. Cheap to clone; clones share all state.
///
/// Methods that may admit work spawn Tokio tasks and must be called from
/// within a Tokio runtime.
pub struct Dispatcher<S, C = SystemClock> {
    shared: Arc<Shared<S, C>>,
}

impl<S, C> Clone for Dispatcher<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RecognitionService> Dispatcher<S, SystemClock> {
    /// Dispatcher on the system clock.
    pub fn with_system_clock(service: S, limits: Limits, options: RequestOptions) -> Self {
        Self::new(service, SystemClock, limits, options)
    }
}

impl<S: RecognitionService, C: Clock> Dispatcher<S, C> {
    pub fn new(service: S, clock: C, limits: Limits, options: RequestOptions) -> Self {
        if !limits.admits_anything() {
            warn!(
                rpm = limits.rpm,
                max_concurrent = limits.max_concurrent,
                "limits admit nothing; queued work will wait"
            );
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(Status::default());
        Self {
            shared: Arc::new(Shared {
                service,
                clock,
                options,
                state: Mutex::new(DispatchState {
                    window: AdmissionWindow::new(limits.rpm),
                    queue: JobQueue::new(),
                    limits,
                    in_flight: 0,
                    event_seq: 0,
                }),
                events,
                status,
                shutdown: Notify::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Work list
    // -----------------------------------------------------------------------

    /// Queue one payload and run admission.
    pub fn enqueue(&self, payload: Payload) -> WorkId {
        let id = {
            let mut st = self.shared.state.lock();
            let id = st.queue.enqueue(payload, Utc::now());
            let event = st.event(EventKind::ItemQueued { id });
            let status = st.status(self.shared.clock.now());
            self.publish(&st, vec![event], status);
            drop(st);
            id
        };
        debug!(id = %id, "enqueued work item");
        self.try_dispatch();
        id
    }

    /// Queue several payloads in order, then run admission once.
    pub fn enqueue_all(&self, payloads: Vec<Payload>) -> Vec<WorkId> {
        let now = Utc::now();
        let ids = {
            let mut st = self.shared.state.lock();
            let mut ids = Vec::with_capacity(payloads.len());
            let mut events = Vec::with_capacity(payloads.len());
            for payload in payloads {
                let id = st.queue.enqueue(payload, now);
                events.push(st.event(EventKind::ItemQueued { id }));
                ids.push(id);
            }
            let status = st.status(self.shared.clock.now());
            self.publish(&st, events, status);
            drop(st);
            ids
        };
        debug!(count = ids.len(), "enqueued work items");
        self.try_dispatch();
        ids
    }

    /// Manually retry a failed item. It rejoins the back of the queue.
    pub fn retry(&self, id: WorkId) -> Result<()> {
        {
            let mut st = self.shared.state.lock();
            st.queue.retry(id)?;
            let event = st.event(EventKind::ItemRetried { id });
            let status = st.status(self.shared.clock.now());
            self.publish(&st, vec![event], status);
            drop(st);
        }
        metrics::work_state_transitions().add(
            1,
            &[KeyValue::new("from", "failed"), KeyValue::new("to", "queued")],
        );
        info!(id = %id, "work item requeued for retry");
        self.try_dispatch();
        Ok(())
    }

    /// Delete an item in any state. An in-flight call for it keeps its
    /// concurrency slot until it returns; its result is discarded.
    pub fn remove(&self, id: WorkId) -> Option<WorkItem> {
        let removed = {
            let mut st = self.shared.state.lock();
            let removed = st.queue.remove(id)?;
            let event = st.event(EventKind::ItemRemoved { id });
            let status = st.status(self.shared.clock.now());
            self.publish(&st, vec![event], status);
            drop(st);
            removed
        };
        info!(id = %id, state = %removed.state, "work item removed");
        self.try_dispatch();
        Some(removed)
    }

    pub fn get(&self, id: WorkId) -> Option<WorkItem> {
        self.shared.state.lock().queue.get(id).cloned()
    }

    /// All items for display, most recently enqueued first.
    pub fn items(&self) -> Vec<WorkItem> {
        self.shared.state.lock().queue.by_recency()
    }

    /// Queued items in admission order.
    pub fn queued_ids(&self) -> Vec<WorkId> {
        self.shared.state.lock().queue.queued_ids()
    }

    // -----------------------------------------------------------------------
    // Limits
    // -----------------------------------------------------------------------

    pub fn limits(&self) -> Limits {
        self.shared.state.lock().limits
    }

    /// Change the rate limit. Follows the coupling policy in [`Limits`].
    pub fn set_rpm(&self, rpm: u32) {
        self.update_limits(|limits| limits.set_rpm(rpm));
    }

    /// Change the concurrency cap. Decouples it from the rate limit.
    pub fn set_max_concurrent(&self, max_concurrent: u32) {
        self.update_limits(|limits| limits.set_max_concurrent(max_concurrent));
    }

    pub fn set_limits(&self, new: Limits) {
        self.update_limits(|limits| *limits = new);
    }

    fn update_limits(&self, f: impl FnOnce(&mut Limits)) {
        let limits = {
            let mut st = self.shared.state.lock();
            f(&mut st.limits);
            let limits = st.limits;
            st.window.set_rpm(limits.rpm);
            let event = st.event(EventKind::LimitsChanged { limits });
            let status = st.status(self.shared.clock.now());
            self.publish(&st, vec![event], status);
            drop(st);
            limits
        };
        info!(
            rpm = limits.rpm,
            max_concurrent = limits.max_concurrent,
            coupled = limits.coupled,
            "limits changed"
        );
        if !limits.admits_anything() {
            warn!("limits admit nothing; queued work will wait");
        }
        self.try_dispatch();
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Whether one more admission fits in the rate window right now.
    pub fn can_admit(&self) -> bool {
        let now = self.shared.clock.now();
        self.shared.state.lock().window.can_admit(now)
    }

    /// Promote as many queued items as the limits allow and start their
    /// service calls. Returns the promoted IDs in admission order.
    ///
    /// Safe to call at any time: promoted items leave the Queued set inside
    /// the same critical section that counted the free slots.
    pub fn try_dispatch(&self) -> Vec<WorkId> {
        let now = self.shared.clock.now();
        let mut events = Vec::new();
        let admitted = {
            let mut st = self.shared.state.lock();
            st.window.prune(now);

            let slots = st.slots(now);
            if slots == 0 {
                if st.queue.count(State::Queued) > 0 {
                    let reason = st.deferral_reason(now);
                    metrics::dispatch_deferred().add(1, &[KeyValue::new("reason", reason)]);
                }
                return Vec::new();
            }

            let ids = st.queue.promote(slots);
            let mut admitted = Vec::with_capacity(ids.len());
            for id in ids {
                let Some((payload, attempt)) = st
                    .queue
                    .get(id)
                    .map(|item| (item.payload.clone(), item.attempts))
                else {
                    continue;
                };
                st.window.record_admission(now);
                st.in_flight += 1;
                let event = st.event(EventKind::ItemProcessing { id, attempt });
                events.push(event);
                admitted.push((id, payload, attempt));
            }
            let status = st.status(now);
            self.publish(&st, events, status);
            drop(st);
            admitted
        };

        let mut ids = Vec::with_capacity(admitted.len());
        for (id, payload, attempt) in admitted {
            ids.push(id);
            self.spawn_call(id, payload, attempt);
        }
        ids
    }

    fn spawn_call(&self, id: WorkId, payload: Payload, attempt: u32) {
        let kind = if payload.is_image() { "image" } else { "text" };
        let span = start_work_span(kind, id, attempt);
        record_state_transition(&span, "queued", "processing");
        metrics::dispatch_admissions().add(1, &[KeyValue::new("payload", kind)]);
        metrics::work_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "queued"),
                KeyValue::new("to", "processing"),
            ],
        );
        info!(id = %id, attempt, payload = %payload.label(), "work item admitted");

        let request = RecognitionRequest::new(payload, &self.shared.options);
        let this = self.clone();
        let task_span = span.clone();
        tokio::spawn(
            async move {
                let started = Instant::now();
                // Run the call as its own task so a panicking service
                // surfaces as a failed item instead of a stuck one.
                let shared = Arc::clone(&this.shared);
                let call = tokio::spawn(
                    async move { shared.service.recognize(request).await }
                        .instrument(Span::current()),
                );
                let result = match call.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Service(format!("service call aborted: {e}"))),
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                this.finish(id, result, duration_ms, &span);
            }
            .instrument(task_span),
        );
    }

    /// Settle an item from its service result, then re-run admission.
    fn finish(&self, id: WorkId, result: Result<Recognition>, duration_ms: u64, span: &Span) {
        let (to, outcome) = match result {
            Ok(Recognition {
                output: ServiceOutput::Error(message),
                thinking,
            }) => (
                State::Failed,
                Outcome {
                    output: None,
                    thinking,
                    error: Some(message),
                    duration_ms,
                },
            ),
            Ok(Recognition { output, thinking }) => (
                State::Completed,
                Outcome {
                    output: Some(output),
                    thinking,
                    error: None,
                    duration_ms,
                },
            ),
            Err(e) => (
                State::Failed,
                Outcome {
                    output: None,
                    thinking: None,
                    error: Some(e.to_string()),
                    duration_ms,
                },
            ),
        };
        let error = outcome.error.clone();

        {
            let mut st = self.shared.state.lock();
            st.in_flight = st.in_flight.saturating_sub(1);
            let mut events = Vec::new();
            match st.queue.settle(id, to, outcome) {
                Ok(()) => {
                    let kind = match error {
                        Some(ref error) => EventKind::ItemFailed {
                            id,
                            error: error.clone(),
                            duration_ms,
                        },
                        None => EventKind::ItemCompleted { id, duration_ms },
                    };
                    events.push(st.event(kind));
                }
                Err(Error::NotFound(_)) => {
                    debug!(id = %id, "result for removed work item discarded");
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "could not settle work item");
                }
            }
            let status = st.status(self.shared.clock.now());
            self.publish(&st, events, status);
            drop(st);
        }

        record_state_transition(span, "processing", &to.to_string());
        metrics::service_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("result", to.to_string())],
        );
        metrics::work_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "processing"),
                KeyValue::new("to", to.to_string()),
            ],
        );
        match error {
            Some(error) => warn!(id = %id, duration_ms, %error, "work item failed"),
            None => info!(id = %id, duration_ms, "work item completed"),
        }

        self.try_dispatch();
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Status {
        let now = self.shared.clock.now();
        self.shared.state.lock().status(now)
    }

    /// Seconds until the next admission slot opens, for display.
    pub fn seconds_until_next_slot(&self) -> u64 {
        let now = self.shared.clock.now();
        self.shared.state.lock().window.seconds_until_next_slot(now)
    }

    pub fn countdown(&self) -> Countdown {
        let now = self.shared.clock.now();
        let st = self.shared.state.lock();
        Countdown {
            seconds_until_next_slot: st.window.seconds_until_next_slot(now),
            available_slots: st.slots(now),
            queued: st.queue.count(State::Queued),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Watch the status snapshot published on every change.
    ///
    /// Do not hold a borrow of the receiver while calling into the
    /// dispatcher; publishing happens under the state lock.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    /// Send events and the new status while the caller still holds the
    /// state lock, so subscribers observe them in lock order.
    fn publish(&self, _held: &DispatchState, events: Vec<Event>, status: Status) {
        for event in events {
            // No subscribers is fine.
            let _ = self.shared.events.send(event);
        }
        self.shared.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// How long until queued work blocked only by the rate window can move.
    ///
    /// None when nothing waits on the window: either nothing is queued, the
    /// concurrency cap is the constraint (a completion will wake us), or the
    /// limits admit nothing.
    fn window_wake(&self) -> Option<Duration> {
        let now = self.shared.clock.now();
        let st = self.shared.state.lock();
        if st.queue.count(State::Queued) == 0 || !st.limits.admits_anything() {
            return None;
        }
        if st.limits.concurrency_cap() <= st.in_flight {
            return None;
        }
        st.window
            .next_slot_at(now)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Re-run admission on every change and at each window roll-over until
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut status = self.watch_status();
        info!("dispatcher started");

        loop {
            self.try_dispatch();
            let wake = self.window_wake();
            if let Some(delay) = wake {
                debug!(delay_ms = delay.as_millis() as u64, "waiting for rate window");
            }

            tokio::select! {
                _ = self.shared.shutdown.notified() => {
                    info!("dispatcher shutting down");
                    return;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep_or_pending(wake) => {}
            }
        }
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn settled(&self) {
        let mut status = self.watch_status();
        loop {
            if status.borrow_and_update().is_settled() {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal [`run`](Self::run) to return.
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_one();
    }
}

async fn sleep_or_pending(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
