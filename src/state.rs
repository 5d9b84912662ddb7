//! Shared state behind sources, subscriptions and controllers.
//!
//! Every source is an `Arc<Shared<T>>` with three independently locked
//! pieces: the subscriber table, the lifecycle callbacks, and the pump set.
//! Locks are only ever taken in the order pumps → state (or singly), and
//! pumps belonging to different sources nest strictly downstream →
//! upstream, so the chain cannot cycle.
//!
//! Delivery is pull-based. Pushing an event appends to each live
//! subscriber's queue and wakes it; a subscriber's poll drains its queue
//! and, when the queue is empty, advances the attached pumps (which poll
//! the upstream subscription and route events through transformer hooks).
//! All state transitions publish under one mutex acquisition, so a
//! transition finished on one stack frame is visible to every later
//! observer. There is no scheduled delivery anywhere in the crate.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use slab::Slab;

use crate::error::{Cancelled, EventError};
use crate::source::SourceKind;

pub(crate) type Event<T> = Result<T, EventError>;

pub(crate) const DUPLICATE_LISTENER: &str =
    "event source already has a listener; a single-subscription source allows exactly one subscribe";
pub(crate) const PUSH_AFTER_CLOSE: &str = "push on a closed source controller";

/// One pump step's outcome.
pub(crate) enum PumpTick {
    /// A source event was dispatched through the hooks.
    Progress,
    /// The upstream is not ready; the poll waker is registered there.
    Pending,
    /// The pump is finished and can be dropped.
    Done,
}

/// A driver that advances an upstream subscription through transformer
/// hooks. Pumps live inside the destination's shared state and are run
/// from the destination subscriber's poll.
pub(crate) trait Pump: Send {
    fn tick(&mut self, cx: &mut Context<'_>) -> PumpTick;
    fn dest_listened(&mut self);
    fn dest_cancelled(&mut self);
    fn dest_paused(&mut self);
    fn dest_resumed(&mut self);
}

#[derive(Clone, Copy)]
enum PumpSignal {
    Listen,
    Cancel,
    Pause,
    Resume,
}

#[derive(Default)]
pub(crate) struct LifecycleHooks {
    pub(crate) on_listen: Option<Box<dyn FnMut() + Send>>,
    pub(crate) on_cancel: Option<Box<dyn FnMut() + Send>>,
    pub(crate) on_pause: Option<Box<dyn FnMut() + Send>>,
    pub(crate) on_resume: Option<Box<dyn FnMut() + Send>>,
}

struct Slot<T> {
    queue: VecDeque<Event<T>>,
    /// Close observed; deliver end-of-stream once the queue drains.
    done: bool,
    waker: Option<Waker>,
    pause_depth: usize,
    cancel_on_error: bool,
}

struct State<T> {
    closed: bool,
    ever_listened: bool,
    active: usize,
    /// Events pushed to a single-subscription source before anyone
    /// listened; handed to the first subscriber.
    prelisten: VecDeque<Event<T>>,
    slots: Slab<Slot<T>>,
}

#[derive(Default)]
struct PumpSet {
    pumps: Vec<Box<dyn Pump>>,
    /// Set once the owning scope tore the pipeline down; late attaches
    /// are dropped on the floor.
    detached: bool,
}

pub(crate) struct Shared<T> {
    kind: SourceKind,
    state: Mutex<State<T>>,
    hooks: Mutex<LifecycleHooks>,
    pumps: Mutex<PumpSet>,
}

enum PumpRun {
    Progress,
    Idle,
}

impl<T> Shared<T> {
    pub(crate) fn new(kind: SourceKind, hooks: LifecycleHooks) -> Self {
        Shared {
            kind,
            state: Mutex::new(State {
                closed: false,
                ever_listened: false,
                active: 0,
                prelisten: VecDeque::new(),
                slots: Slab::new(),
            }),
            hooks: Mutex::new(hooks),
            pumps: Mutex::new(PumpSet::default()),
        }
    }

    pub(crate) fn kind(&self) -> SourceKind {
        self.kind
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.state.lock().unwrap().active > 0
    }

    /// Registers a subscriber and returns its slot key.
    ///
    /// Panics when a single-subscription source is subscribed a second
    /// time; the panic surfaces synchronously on the subscriber's stack.
    pub(crate) fn subscribe(&self, cancel_on_error: bool) -> usize {
        let duplicate;
        let fire_listen;
        let key;
        {
            let mut state = self.state.lock().unwrap();
            duplicate = self.kind == SourceKind::SingleSubscription && state.ever_listened;
            if duplicate {
                key = 0;
                fire_listen = false;
            } else {
                state.ever_listened = true;
                let queue = if self.kind == SourceKind::SingleSubscription {
                    mem::take(&mut state.prelisten)
                } else {
                    VecDeque::new()
                };
                let closed = state.closed;
                key = state.slots.insert(Slot {
                    queue,
                    done: closed,
                    waker: None,
                    pause_depth: 0,
                    cancel_on_error,
                });
                state.active += 1;
                fire_listen = state.active == 1;
            }
        }
        if duplicate {
            panic!("{}", DUPLICATE_LISTENER);
        }
        if fire_listen {
            self.fire_listen_hook();
            self.notify_pumps(PumpSignal::Listen);
        }
        key
    }

    /// Drains one event for the given subscriber, pumping upstream work
    /// when its queue is empty.
    pub(crate) fn poll_slot(&self, key: usize, cx: &mut Context<'_>) -> Poll<Option<Event<T>>> {
        enum Step<T> {
            Deliver(Event<T>),
            AutoCancel(Event<T>),
            Finished,
            Wait { paused: bool },
        }

        loop {
            let step = {
                let mut state = self.state.lock().unwrap();
                let step = match state.slots.get_mut(key) {
                    None => return Poll::Ready(None),
                    Some(slot) => {
                        if slot.pause_depth > 0 {
                            // Pause gates delivery itself; queued events wait.
                            slot.waker = Some(cx.waker().clone());
                            Step::Wait { paused: true }
                        } else if let Some(event) = slot.queue.pop_front() {
                            if event.is_err() && slot.cancel_on_error {
                                Step::AutoCancel(event)
                            } else {
                                Step::Deliver(event)
                            }
                        } else if slot.done {
                            Step::Finished
                        } else {
                            slot.waker = Some(cx.waker().clone());
                            Step::Wait { paused: false }
                        }
                    }
                };
                if let Step::Finished = step {
                    state.slots.remove(key);
                    state.active -= 1;
                }
                step
            };
            match step {
                Step::Deliver(event) => return Poll::Ready(Some(event)),
                Step::AutoCancel(event) => {
                    self.cancel_slot(key);
                    return Poll::Ready(Some(event));
                }
                Step::Finished => return Poll::Ready(None),
                Step::Wait { paused: true } => return Poll::Pending,
                Step::Wait { paused: false } => match self.run_pumps(cx) {
                    PumpRun::Progress => continue,
                    PumpRun::Idle => return Poll::Pending,
                },
            }
        }
    }

    /// Tears down a subscriber slot. Queued events are discarded. Fires
    /// the cancel hooks when the last live subscriber goes away.
    ///
    /// Remaining subscribers are woken: the departing one may have been
    /// the one driving the pumps, and the upstream waker registration
    /// went with it.
    pub(crate) fn cancel_slot(&self, key: usize) {
        let (fire_cancel, wakers) = {
            let mut state = self.state.lock().unwrap();
            if state.slots.try_remove(key).is_none() {
                return;
            }
            state.active -= 1;
            let wakers: Vec<Waker> = state
                .slots
                .iter_mut()
                .filter_map(|(_, slot)| slot.waker.take())
                .collect();
            (state.active == 0, wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        if fire_cancel {
            self.fire_cancel_hook();
            self.notify_pumps(PumpSignal::Cancel);
        }
    }

    /// Increments the subscriber's pause depth. Hooks fire only on the
    /// transition into the paused state. Broadcast sources ignore pause.
    pub(crate) fn pause_slot(&self, key: usize) {
        if self.kind == SourceKind::Broadcast {
            return;
        }
        let fire = {
            let mut state = self.state.lock().unwrap();
            match state.slots.get_mut(key) {
                None => false,
                Some(slot) => {
                    slot.pause_depth += 1;
                    slot.pause_depth == 1
                }
            }
        };
        if fire {
            self.fire_pause_hook();
            self.notify_pumps(PumpSignal::Pause);
        }
    }

    /// Decrements the pause depth; fires hooks and wakes the subscriber
    /// on the transition out of the paused state.
    pub(crate) fn resume_slot(&self, key: usize) {
        if self.kind == SourceKind::Broadcast {
            return;
        }
        let (fire, waker) = {
            let mut state = self.state.lock().unwrap();
            match state.slots.get_mut(key) {
                None => (false, None),
                Some(slot) => {
                    if slot.pause_depth == 0 {
                        (false, None)
                    } else {
                        slot.pause_depth -= 1;
                        if slot.pause_depth == 0 {
                            (true, slot.waker.take())
                        } else {
                            (false, None)
                        }
                    }
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        if fire {
            self.fire_resume_hook();
            self.notify_pumps(PumpSignal::Resume);
        }
    }

    /// Appends an event to every live subscriber's queue.
    ///
    /// With no subscriber, a single-subscription source buffers the event
    /// for its future listener; a broadcast source drops it. Panics when
    /// the controller has been closed.
    pub(crate) fn push_event(&self, event: Event<T>)
    where
        T: Clone,
    {
        let mut wakers = Vec::new();
        let closed = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                true
            } else {
                if state.slots.is_empty() {
                    if self.kind == SourceKind::SingleSubscription && !state.ever_listened {
                        state.prelisten.push_back(event);
                    }
                } else {
                    for (_, slot) in state.slots.iter_mut() {
                        slot.queue.push_back(event.clone());
                        if slot.pause_depth == 0 {
                            if let Some(waker) = slot.waker.take() {
                                wakers.push(waker);
                            }
                        }
                    }
                }
                false
            }
        };
        if closed {
            panic!("{}", PUSH_AFTER_CLOSE);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Marks the source done. Queued events still drain; each subscriber
    /// then observes end-of-stream. Idempotent.
    pub(crate) fn close(&self) {
        let wakers = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut wakers = Vec::new();
            for (_, slot) in state.slots.iter_mut() {
                slot.done = true;
                if let Some(waker) = slot.waker.take() {
                    wakers.push(waker);
                }
            }
            wakers
        };
        tracing::trace!(kind = ?self.kind, "source closed");
        for waker in wakers {
            waker.wake();
        }
    }

    /// Scope-driven teardown: detach and drop the pumps (cancelling their
    /// upstream subscriptions), then, if the source is still open, discard
    /// everything undelivered, inject exactly one cancellation error and
    /// close. Subscribers observe the error and then end-of-stream; a
    /// future first listener of a single-subscription source observes the
    /// same pair.
    pub(crate) fn scope_cancel(&self, signal: Cancelled) {
        self.shutdown_pumps();
        let wakers = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                state.prelisten.clear();
                let mut wakers = Vec::new();
                if state.slots.is_empty() {
                    if self.kind == SourceKind::SingleSubscription && !state.ever_listened {
                        state
                            .prelisten
                            .push_back(Err(EventError::Cancelled(signal.clone())));
                    }
                } else {
                    for (_, slot) in state.slots.iter_mut() {
                        slot.queue.clear();
                        slot.queue
                            .push_back(Err(EventError::Cancelled(signal.clone())));
                        slot.done = true;
                        if let Some(waker) = slot.waker.take() {
                            wakers.push(waker);
                        }
                    }
                }
                wakers
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn attach_pump(&self, pump: Box<dyn Pump>) {
        let mut set = self.pumps.lock().unwrap();
        if !set.detached {
            set.pumps.push(pump);
        }
    }

    pub(crate) fn shutdown_pumps(&self) {
        let dropped = {
            let mut set = self.pumps.lock().unwrap();
            set.detached = true;
            mem::take(&mut set.pumps)
        };
        // Dropping a pump drops its upstream subscription, which cancels it.
        drop(dropped);
    }

    fn run_pumps(&self, cx: &mut Context<'_>) -> PumpRun {
        let mut set = match self.pumps.try_lock() {
            Ok(set) => set,
            // Another subscriber is pumping; our waker is registered.
            Err(_) => return PumpRun::Idle,
        };
        if set.pumps.is_empty() {
            return PumpRun::Idle;
        }
        let mut progressed = false;
        let mut index = 0;
        while index < set.pumps.len() {
            match set.pumps[index].tick(cx) {
                PumpTick::Progress => {
                    progressed = true;
                    index += 1;
                }
                PumpTick::Pending => index += 1,
                PumpTick::Done => {
                    set.pumps.remove(index);
                    progressed = true;
                }
            }
        }
        if progressed {
            PumpRun::Progress
        } else {
            PumpRun::Idle
        }
    }

    fn notify_pumps(&self, signal: PumpSignal) {
        let mut set = self.pumps.lock().unwrap();
        for pump in set.pumps.iter_mut() {
            match signal {
                PumpSignal::Listen => pump.dest_listened(),
                PumpSignal::Cancel => pump.dest_cancelled(),
                PumpSignal::Pause => pump.dest_paused(),
                PumpSignal::Resume => pump.dest_resumed(),
            }
        }
    }

    fn fire_listen_hook(&self) {
        let taken = self.hooks.lock().unwrap().on_listen.take();
        if let Some(mut hook) = taken {
            hook();
            self.hooks.lock().unwrap().on_listen = Some(hook);
        }
    }

    fn fire_cancel_hook(&self) {
        let taken = self.hooks.lock().unwrap().on_cancel.take();
        if let Some(mut hook) = taken {
            hook();
            self.hooks.lock().unwrap().on_cancel = Some(hook);
        }
    }

    fn fire_pause_hook(&self) {
        let taken = self.hooks.lock().unwrap().on_pause.take();
        if let Some(mut hook) = taken {
            hook();
            self.hooks.lock().unwrap().on_pause = Some(hook);
        }
    }

    fn fire_resume_hook(&self) {
        let taken = self.hooks.lock().unwrap().on_resume.take();
        if let Some(mut hook) = taken {
            hook();
            self.hooks.lock().unwrap().on_resume = Some(hook);
        }
    }
}

pub(crate) type SharedRef<T> = Arc<Shared<T>>;
