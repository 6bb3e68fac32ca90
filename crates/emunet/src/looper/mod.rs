// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded reactor multiplexing fd readiness and timers.
//!
//! A [`Looper`] owns a `mio::Poll` and two slot arenas: one for fd watches,
//! one for timers. Watches and timers are addressed through small `Copy`
//! handles ([`FdWatch`], [`Timer`]) carrying a generation counter, so a
//! stale handle held after deletion is simply ignored instead of touching
//! a reused slot.
//!
//! Each loop iteration is a strict two-phase step: first collect every
//! ready fd and every expired timer into pending lists, then fire all
//! pending timers (in deadline order) followed by all pending watches.
//! Pending state is cleared *before* a callback is invoked, so a callback
//! that deletes its own watch/timer, or registers new ones, never corrupts
//! the iteration over the structures being drained.
//!
//! All callbacks run on the thread calling [`Looper::run`]; nothing in
//! here is `Send`. Cross-thread signaling goes through [`wake::wake_pair`].

pub mod wake;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Sentinel deadline meaning "inactive" / "wait forever".
pub const DEADLINE_INFINITE: u64 = u64::MAX;

/// Maximum events drained from the OS poller per iteration.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Event set
// ============================================================================

/// Bitmask of fd readiness events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    /// No events.
    pub const NONE: EventSet = EventSet(0);
    /// Read readiness.
    pub const READ: EventSet = EventSet(1);
    /// Write readiness.
    pub const WRITE: EventSet = EventSet(2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    fn intersect(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Handle to a registered interest in read/write readiness on one fd.
///
/// The fd itself stays owned by the caller; deleting the watch never
/// closes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdWatch {
    index: usize,
    gen: u64,
}

/// Handle to a deadline-based one-shot alarm.
///
/// Inert until armed with [`Looper::timer_start_relative`] or
/// [`Looper::timer_start_absolute`]. Re-arming from inside its own
/// callback is legal and re-inserts it in deadline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timer {
    index: usize,
    gen: u64,
}

/// Why [`Looper::run_with_deadline_ms`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The deadline passed before [`Looper::force_quit`] was called.
    Timeout,
    /// No active watches or timers remain; blocking would never wake up.
    Empty,
    /// [`Looper::force_quit`] was called from a callback.
    Quit,
}

/// Callback invoked when a watched fd becomes ready for a wanted event.
pub type WatchCallback = Box<dyn FnMut(&mut Looper, FdWatch, EventSet)>;

/// Callback invoked when a timer deadline expires.
pub type TimerCallback = Box<dyn FnMut(&mut Looper, Timer)>;

// ============================================================================
// Slots
// ============================================================================

struct WatchSlot {
    gen: u64,
    fd: RawFd,
    /// Events the owner currently wants.
    wanted: EventSet,
    /// Last events observed from the poller.
    last: EventSet,
    /// Events collected but not yet dispatched this iteration.
    pending: EventSet,
    registered: bool,
    /// Taken out while the callback runs, so the callback may re-enter
    /// the looper with `&mut self`.
    callback: Option<WatchCallback>,
}

struct TimerSlot {
    gen: u64,
    /// `DEADLINE_INFINITE` when not armed.
    deadline: u64,
    pending: bool,
    callback: Option<TimerCallback>,
}

// ============================================================================
// Looper
// ============================================================================

/// Single-threaded event loop. See module docs.
pub struct Looper {
    poll: Poll,
    events: Events,
    origin: Instant,
    watches: Vec<Option<WatchSlot>>,
    free_watches: Vec<usize>,
    fd_index: HashMap<RawFd, usize>,
    timers: Vec<Option<TimerSlot>>,
    free_timers: Vec<usize>,
    /// Active timers, ordered by (deadline, slot index).
    armed: BTreeSet<(u64, usize)>,
    pending_watches: Vec<(usize, u64)>,
    pending_timers: Vec<(usize, u64)>,
    next_gen: u64,
    quit: bool,
}

impl Looper {
    pub fn new() -> io::Result<Looper> {
        Ok(Looper {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            origin: Instant::now(),
            watches: Vec::new(),
            free_watches: Vec::new(),
            fd_index: HashMap::new(),
            timers: Vec::new(),
            free_timers: Vec::new(),
            armed: BTreeSet::new(),
            pending_watches: Vec::new(),
            pending_timers: Vec::new(),
            next_gen: 1,
            quit: false,
        })
    }

    /// Monotonic milliseconds since this looper was created.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Stop the loop after the current dispatch batch finishes.
    ///
    /// Only meaningful from inside a callback running on this looper's
    /// thread; the flag is checked at the top of each iteration.
    pub fn force_quit(&mut self) {
        self.quit = true;
    }

    // ------------------------------------------------------------------
    // Fd watches
    // ------------------------------------------------------------------

    /// Register interest in readiness events on `fd`.
    ///
    /// The watch starts inactive; call [`Looper::watch_want_read`] or
    /// [`Looper::watch_want_write`] to receive events. At most one watch
    /// may exist per fd.
    pub fn create_fd_watch(
        &mut self,
        fd: RawFd,
        callback: WatchCallback,
    ) -> io::Result<FdWatch> {
        if self.fd_index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} already watched", fd),
            ));
        }
        let gen = self.next_gen;
        self.next_gen += 1;
        let slot = WatchSlot {
            gen,
            fd,
            wanted: EventSet::NONE,
            last: EventSet::NONE,
            pending: EventSet::NONE,
            registered: false,
            callback: Some(callback),
        };
        let index = match self.free_watches.pop() {
            Some(i) => {
                self.watches[i] = Some(slot);
                i
            }
            None => {
                self.watches.push(Some(slot));
                self.watches.len() - 1
            }
        };
        self.fd_index.insert(fd, index);
        Ok(FdWatch { index, gen })
    }

    /// Unregister the watch from the poller and the pending-dispatch list.
    ///
    /// Safe to call from the watch's own callback. The fd is not closed.
    pub fn delete_watch(&mut self, watch: FdWatch) {
        let Some(slot) = self.watch_slot(watch) else {
            return;
        };
        let fd = slot.fd;
        if slot.registered {
            // The fd may already be closed; deregistration failure is
            // harmless at this point.
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.fd_index.remove(&fd);
        self.watches[watch.index] = None;
        self.free_watches.push(watch.index);
    }

    pub fn watch_want_read(&mut self, watch: FdWatch) {
        self.watch_update(watch, EventSet::READ, true);
    }

    pub fn watch_want_write(&mut self, watch: FdWatch) {
        self.watch_update(watch, EventSet::WRITE, true);
    }

    pub fn watch_dont_want_read(&mut self, watch: FdWatch) {
        self.watch_update(watch, EventSet::READ, false);
    }

    pub fn watch_dont_want_write(&mut self, watch: FdWatch) {
        self.watch_update(watch, EventSet::WRITE, false);
    }

    /// Events the watch currently wants.
    pub fn watch_wanted(&self, watch: FdWatch) -> EventSet {
        self.watch_slot_ref(watch)
            .map_or(EventSet::NONE, |s| s.wanted)
    }

    /// Last events observed on the fd.
    pub fn watch_poll(&self, watch: FdWatch) -> EventSet {
        self.watch_slot_ref(watch)
            .map_or(EventSet::NONE, |s| s.last)
    }

    fn watch_update(&mut self, watch: FdWatch, events: EventSet, want: bool) {
        let Some(slot) = self
            .watches
            .get_mut(watch.index)
            .and_then(Option::as_mut)
            .filter(|s| s.gen == watch.gen)
        else {
            return;
        };
        let wanted = if want {
            slot.wanted | events
        } else {
            EventSet(slot.wanted.0 & !events.0)
        };
        if wanted == slot.wanted {
            return;
        }
        slot.wanted = wanted;
        let fd = slot.fd;
        let registered = slot.registered;
        let interest = interest_for(wanted);
        let registry = self.poll.registry();
        let result = match (registered, interest) {
            (false, Some(interest)) => {
                slot.registered = true;
                registry.register(&mut SourceFd(&fd), Token(watch.index), interest)
            }
            (true, Some(interest)) => {
                registry.reregister(&mut SourceFd(&fd), Token(watch.index), interest)
            }
            (true, None) => {
                slot.registered = false;
                registry.deregister(&mut SourceFd(&fd))
            }
            (false, None) => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("fd watch update failed for fd {}: {}", fd, e);
        }
    }

    fn watch_slot(&mut self, watch: FdWatch) -> Option<&mut WatchSlot> {
        self.watches
            .get_mut(watch.index)
            .and_then(Option::as_mut)
            .filter(|s| s.gen == watch.gen)
    }

    fn watch_slot_ref(&self, watch: FdWatch) -> Option<&WatchSlot> {
        self.watches
            .get(watch.index)
            .and_then(Option::as_ref)
            .filter(|s| s.gen == watch.gen)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Create an inert timer. Arm it with `timer_start_*`.
    pub fn create_timer(&mut self, callback: TimerCallback) -> Timer {
        let gen = self.next_gen;
        self.next_gen += 1;
        let slot = TimerSlot {
            gen,
            deadline: DEADLINE_INFINITE,
            pending: false,
            callback: Some(callback),
        };
        let index = match self.free_timers.pop() {
            Some(i) => {
                self.timers[i] = Some(slot);
                i
            }
            None => {
                self.timers.push(Some(slot));
                self.timers.len() - 1
            }
        };
        Timer { index, gen }
    }

    /// Arm the timer to fire `ms` milliseconds from now.
    pub fn timer_start_relative(&mut self, timer: Timer, ms: u64) {
        let deadline = self.now_ms().saturating_add(ms);
        self.timer_start_absolute(timer, deadline);
    }

    /// Arm the timer for an absolute deadline (see [`Looper::now_ms`]).
    /// `DEADLINE_INFINITE` stops the timer.
    pub fn timer_start_absolute(&mut self, timer: Timer, deadline_ms: u64) {
        let Some(slot) = self
            .timers
            .get_mut(timer.index)
            .and_then(Option::as_mut)
            .filter(|s| s.gen == timer.gen)
        else {
            return;
        };
        if slot.deadline != DEADLINE_INFINITE {
            self.armed.remove(&(slot.deadline, timer.index));
        }
        slot.pending = false;
        slot.deadline = deadline_ms;
        if deadline_ms != DEADLINE_INFINITE {
            self.armed.insert((deadline_ms, timer.index));
        }
    }

    /// Stop the timer without destroying it.
    pub fn timer_stop(&mut self, timer: Timer) {
        self.timer_start_absolute(timer, DEADLINE_INFINITE);
    }

    /// True while the timer is armed or collected-but-not-yet-fired.
    pub fn timer_is_active(&self, timer: Timer) -> bool {
        self.timers
            .get(timer.index)
            .and_then(Option::as_ref)
            .filter(|s| s.gen == timer.gen)
            .is_some_and(|s| s.deadline != DEADLINE_INFINITE || s.pending)
    }

    /// Destroy the timer. Safe to call from its own callback.
    pub fn delete_timer(&mut self, timer: Timer) {
        let Some(slot) = self
            .timers
            .get_mut(timer.index)
            .and_then(Option::as_mut)
            .filter(|s| s.gen == timer.gen)
        else {
            return;
        };
        if slot.deadline != DEADLINE_INFINITE {
            self.armed.remove(&(slot.deadline, timer.index));
        }
        self.timers[timer.index] = None;
        self.free_timers.push(timer.index);
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until `force_quit` or until no active watches/timers remain.
    pub fn run(&mut self) -> ExitReason {
        self.run_with_deadline_ms(DEADLINE_INFINITE)
    }

    /// Run for at most `timeout` from now.
    pub fn run_with_timeout(&mut self, timeout: Duration) -> ExitReason {
        let deadline = self.now_ms().saturating_add(timeout.as_millis() as u64);
        self.run_with_deadline_ms(deadline)
    }

    /// Process I/O and timer events until the deadline passes
    /// (`Timeout`), nothing can ever fire again (`Empty`), or a callback
    /// calls [`Looper::force_quit`] (`Quit`).
    pub fn run_with_deadline_ms(&mut self, deadline_ms: u64) -> ExitReason {
        self.quit = false;
        loop {
            if self.quit {
                return ExitReason::Quit;
            }
            if !self.has_active() {
                return ExitReason::Empty;
            }
            let now = self.now_ms();
            if now >= deadline_ms {
                return ExitReason::Timeout;
            }

            let next_timer = self
                .armed
                .iter()
                .next()
                .map_or(DEADLINE_INFINITE, |&(d, _)| d);
            let wait_until = next_timer.min(deadline_ms);
            let timeout = if wait_until == DEADLINE_INFINITE {
                None
            } else {
                Some(Duration::from_millis(wait_until.saturating_sub(now)))
            };

            // Phase 1: collect ready fds.
            let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.events = events;
                    continue;
                }
                Err(e) => {
                    log::error!("poll failed: {}", e);
                    self.events = events;
                    return ExitReason::Empty;
                }
            }
            for event in events.iter() {
                let index = event.token().0;
                let Some(slot) = self.watches.get_mut(index).and_then(Option::as_mut) else {
                    continue;
                };
                let mut ready = EventSet::NONE;
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    ready |= EventSet::READ;
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    ready |= EventSet::WRITE;
                }
                slot.last = ready;
                let fired = ready.intersect(slot.wanted);
                if !fired.is_empty() {
                    if slot.pending.is_empty() {
                        self.pending_watches.push((index, slot.gen));
                    }
                    slot.pending |= fired;
                }
            }
            self.events = events;

            // Phase 2: collect expired timers, in deadline order.
            let now = self.now_ms();
            while let Some(&(deadline, index)) = self.armed.iter().next() {
                if deadline > now {
                    break;
                }
                self.armed.remove(&(deadline, index));
                if let Some(slot) = self.timers.get_mut(index).and_then(Option::as_mut) {
                    slot.deadline = DEADLINE_INFINITE;
                    slot.pending = true;
                    self.pending_timers.push((index, slot.gen));
                }
            }

            // Phases 3 and 4: fire timers, then watches.
            self.fire_pending_timers();
            self.fire_pending_watches();
        }
    }

    fn has_active(&self) -> bool {
        !self.armed.is_empty()
            || self
                .watches
                .iter()
                .flatten()
                .any(|s| !s.wanted.is_empty())
    }

    fn fire_pending_timers(&mut self) {
        let pending = std::mem::take(&mut self.pending_timers);
        for (index, gen) in pending {
            let mut callback = {
                let Some(slot) = self.timers.get_mut(index).and_then(Option::as_mut) else {
                    continue;
                };
                if slot.gen != gen || !slot.pending {
                    continue;
                }
                slot.pending = false;
                let Some(cb) = slot.callback.take() else {
                    continue;
                };
                cb
            };
            callback(self, Timer { index, gen });
            if let Some(slot) = self.timers.get_mut(index).and_then(Option::as_mut) {
                if slot.gen == gen && slot.callback.is_none() {
                    slot.callback = Some(callback);
                }
            }
        }
    }

    fn fire_pending_watches(&mut self) {
        let pending = std::mem::take(&mut self.pending_watches);
        for (index, gen) in pending {
            let (mut callback, fired) = {
                let Some(slot) = self.watches.get_mut(index).and_then(Option::as_mut) else {
                    continue;
                };
                if slot.gen != gen {
                    continue;
                }
                // Only deliver what is still wanted; a callback earlier in
                // this batch may have de-armed the watch.
                let fired = slot.pending.intersect(slot.wanted);
                slot.pending = EventSet::NONE;
                if fired.is_empty() {
                    continue;
                }
                let Some(cb) = slot.callback.take() else {
                    continue;
                };
                (cb, fired)
            };
            callback(self, FdWatch { index, gen }, fired);
            if let Some(slot) = self.watches.get_mut(index).and_then(Option::as_mut) {
                if slot.gen == gen && slot.callback.is_none() {
                    slot.callback = Some(callback);
                }
            }
        }
    }
}

fn interest_for(events: EventSet) -> Option<Interest> {
    match (
        events.contains(EventSet::READ),
        events.contains(EventSet::WRITE),
    ) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn test_empty_looper_returns_immediately() {
        let mut looper = Looper::new().unwrap();
        let start = Instant::now();
        assert_eq!(looper.run(), ExitReason::Empty);
        assert_eq!(
            looper.run_with_deadline_ms(DEADLINE_INFINITE),
            ExitReason::Empty
        );
        // Even with a generous deadline: nothing can ever fire, so Empty
        // wins over Timeout.
        assert_eq!(
            looper.run_with_timeout(Duration::from_secs(10)),
            ExitReason::Empty
        );
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_timer_liveness() {
        let mut looper = Looper::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let timer = looper.create_timer({
            let fired = fired.clone();
            Box::new(move |_lp, _t| fired.set(true))
        });
        looper.timer_start_relative(timer, 30);
        assert!(looper.timer_is_active(timer));

        let start = Instant::now();
        // Timer fires, then nothing is active -> Empty.
        assert_eq!(looper.run(), ExitReason::Empty);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(fired.get());
        assert!(!looper.timer_is_active(timer));
    }

    #[test]
    fn test_timer_fires_once() {
        let mut looper = Looper::new().unwrap();
        let count = Rc::new(Cell::new(0u32));
        let timer = looper.create_timer({
            let count = count.clone();
            Box::new(move |_lp, _t| count.set(count.get() + 1))
        });
        looper.timer_start_relative(timer, 5);
        looper.run();
        looper.run_with_timeout(Duration::from_millis(30));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_self_deleting_timer() {
        let mut looper = Looper::new().unwrap();
        let timer = looper.create_timer(Box::new(move |lp, t| {
            lp.delete_timer(t);
        }));
        looper.timer_start_relative(timer, 5);
        assert_eq!(looper.run(), ExitReason::Empty);
        // Stale handle is ignored.
        assert!(!looper.timer_is_active(timer));
        looper.timer_start_relative(timer, 1);
        assert_eq!(looper.run(), ExitReason::Empty);
    }

    #[test]
    fn test_timer_rearm_from_callback() {
        let mut looper = Looper::new().unwrap();
        let count = Rc::new(Cell::new(0u32));
        let timer = looper.create_timer({
            let count = count.clone();
            Box::new(move |lp, t| {
                count.set(count.get() + 1);
                if count.get() < 3 {
                    lp.timer_start_relative(t, 1);
                }
            })
        });
        looper.timer_start_relative(timer, 1);
        assert_eq!(looper.run(), ExitReason::Empty);
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut looper = Looper::new().unwrap();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let base = looper.now_ms();
        for (tag, offset) in [(2u32, 20u64), (0, 5), (1, 10)] {
            let order = order.clone();
            let timer = looper.create_timer(Box::new(move |_lp, _t| {
                order.borrow_mut().push(tag);
            }));
            looper.timer_start_absolute(timer, base + offset);
        }
        assert_eq!(looper.run(), ExitReason::Empty);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_force_quit_from_callback() {
        let mut looper = Looper::new().unwrap();
        let timer = looper.create_timer(Box::new(|lp, _t| lp.force_quit()));
        looper.timer_start_relative(timer, 5);
        assert_eq!(looper.run(), ExitReason::Quit);
    }

    #[test]
    fn test_deadline_timeout() {
        let mut looper = Looper::new().unwrap();
        // Keep the looper non-empty with a far-future timer.
        let timer = looper.create_timer(Box::new(|_lp, _t| {}));
        looper.timer_start_relative(timer, 60_000);
        let start = Instant::now();
        assert_eq!(
            looper.run_with_timeout(Duration::from_millis(40)),
            ExitReason::Timeout
        );
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_fd_watch_read_readiness() {
        let mut looper = Looper::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let got = Rc::new(Cell::new(EventSet::NONE));
        let watch = looper
            .create_fd_watch(b.as_raw_fd(), {
                let got = got.clone();
                Box::new(move |lp, w, ev| {
                    got.set(ev);
                    lp.watch_dont_want_read(w);
                    lp.force_quit();
                })
            })
            .unwrap();
        looper.watch_want_read(watch);

        a.write_all(b"x").unwrap();
        assert_eq!(
            looper.run_with_timeout(Duration::from_secs(5)),
            ExitReason::Quit
        );
        assert!(got.get().contains(EventSet::READ));
        assert!(looper.watch_poll(watch).contains(EventSet::READ));
        looper.delete_watch(watch);
    }

    #[test]
    fn test_inactive_watch_gets_no_events() {
        let mut looper = Looper::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let fired = Rc::new(Cell::new(false));
        let _watch = looper
            .create_fd_watch(b.as_raw_fd(), {
                let fired = fired.clone();
                Box::new(move |_lp, _w, _ev| fired.set(true))
            })
            .unwrap();
        // Never armed: the looper is empty and data must not fire the watch.
        a.write_all(b"x").unwrap();
        assert_eq!(
            looper.run_with_timeout(Duration::from_millis(20)),
            ExitReason::Empty
        );
        assert!(!fired.get());
    }

    #[test]
    fn test_one_watch_per_fd() {
        let mut looper = Looper::new().unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        let w = looper
            .create_fd_watch(b.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap();
        let err = looper
            .create_fd_watch(b.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        looper.delete_watch(w);
        // After deletion the fd may be watched again.
        let w2 = looper
            .create_fd_watch(b.as_raw_fd(), Box::new(|_, _, _| {}))
            .unwrap();
        looper.delete_watch(w2);
    }

    #[test]
    fn test_watch_self_delete_from_callback() {
        let mut looper = Looper::new().unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let watch = looper
            .create_fd_watch(
                b.as_raw_fd(),
                Box::new(move |lp, w, _ev| {
                    lp.delete_watch(w);
                    lp.force_quit();
                }),
            )
            .unwrap();
        looper.watch_want_read(watch);
        a.write_all(b"x").unwrap();
        assert_eq!(
            looper.run_with_timeout(Duration::from_secs(5)),
            ExitReason::Quit
        );
        // Stale handle operations are no-ops.
        looper.watch_want_read(watch);
        looper.delete_watch(watch);
    }
}
