//! Single-threaded readiness dispatch: one mio `Poll` for descriptors plus a
//! min-heap of timers with millisecond granularity. Each cycle sweeps the
//! ready descriptors first, then fires expired timers in deadline order,
//! ties broken by insertion order.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::time::{Duration, Instant};

/// Timer granularity: deadlines are rounded up to the next tick.
pub const TICK: Duration = Duration::from_millis(1);

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

struct TimerEntry<K> {
    deadline: Instant,
    /// Insertion order; the tie-break for equal deadlines.
    seq: u64,
    id: TimerId,
    key: K,
}

impl<K> PartialEq for TimerEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for TimerEntry<K> {}

impl<K> PartialOrd for TimerEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for TimerEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the BinaryHeap is a max-heap, the earliest deadline must
        // surface first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered timers with lazy cancellation.
struct Timers<K> {
    heap: BinaryHeap<TimerEntry<K>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl<K> Timers<K> {
    fn new() -> Timers<K> {
        Timers {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    fn arm(&mut self, key: K, delay: Duration, now: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        let seq = self.next_id;
        self.next_id += 1;

        // Round up to the tick so a zero delay still lands one tick out.
        let ticks = (delay.as_nanos() + TICK.as_nanos() - 1) / TICK.as_nanos();
        let deadline = now + TICK * ticks.max(1) as u32;

        self.heap.push(TimerEntry {
            deadline,
            seq,
            id,
            key,
        });
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Earliest live deadline, dropping cancelled entries on the way.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.remove(&entry.id) {
                self.heap.pop();
            } else {
                return Some(entry.deadline);
            }
        }
        None
    }

    fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, K)> {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.remove(&entry.id) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry exists");
            return Some((entry.id, entry.key));
        }
        None
    }
}

/// One readiness observation from the poll sweep.
#[derive(Debug, Copy, Clone)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub struct EventLoop<K> {
    poll: Poll,
    events: Events,
    timers: Timers<K>,
}

impl<K> EventLoop<K> {
    pub fn new() -> io::Result<EventLoop<K>> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            timers: Timers::new(),
        })
    }

    /// Registry handle for components that manage their own sockets.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn register(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn arm_timer(&mut self, key: K, delay: Duration, now: Instant) -> TimerId {
        self.timers.arm(key, delay, now)
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Blocks until a descriptor is ready or the next timer is due, then
    /// returns the readiness sweep. Timer dispatch happens separately via
    /// [`EventLoop::expired`], after the sweep.
    pub fn poll_io(&mut self, now: Instant) -> io::Result<Vec<Readiness>> {
        let timeout = self.timers.next_deadline().map(|deadline| {
            if deadline <= now {
                Duration::from_millis(0)
            } else {
                deadline - now
            }
        });

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            })
            .collect())
    }

    /// Pops every timer due at `now`, in deadline order.
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerId, K)> {
        let mut due = Vec::new();
        while let Some(expired) = self.timers.pop_expired(now) {
            due.push(expired);
        }
        due
    }
}
