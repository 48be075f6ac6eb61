//! Tag-correlated mailboxes.
//!
//! A message that arrives before anyone waits for its tag is buffered. A waiter is a
//! [oneshot] receiver registered on first access. Resolving a tag removes its entry.
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use oneshot::RecvTimeoutError;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::{MpcError, MpcResult};
use super::PartyId;
use crate::network::message::{decode, Tag};

/// Tags nobody will wait on again. Late arrivals for them are dropped until the entry expires.
#[derive(Default)]
struct Closed(HashMap<Tag, Instant>);

impl Closed {
    fn close(&mut self, tag: Tag, ttl: Duration) {
        self.0.insert(tag, Instant::now() + ttl);
    }

    fn reopen(&mut self, tag: &str) {
        self.0.remove(tag);
    }

    fn contains(&self, tag: &str) -> bool {
        self.0.contains_key(tag)
    }

    fn sweep(&mut self, now: Instant) {
        self.0.retain(|_, expiry| *expiry > now);
    }
}

enum Slot {
    Arrived(Vec<u8>, Instant),
    Waiting(oneshot::Sender<Vec<u8>>),
}

#[derive(Default)]
struct Slots {
    open: HashMap<Tag, Slot>,
    closed: Closed,
}

/// Holds at most one message per tag.
///
/// Unclaimed messages are dropped after `ttl`.
pub struct Mailbox {
    name: &'static str,
    ttl: Duration,
    slots: Mutex<Slots>,
}

impl Mailbox {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self { name, ttl, slots: Mutex::new(Slots::default()) }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let before = slots.open.len();
        slots.open.retain(|_, slot| match slot {
            Slot::Arrived(_, at) => now.duration_since(*at) < self.ttl,
            Slot::Waiting(_) => true,
        });
        if slots.open.len() < before {
            debug!("{} expired {} unclaimed messages", self.name, before - slots.open.len());
        }
        slots.closed.sweep(now);
        slots
    }

    pub fn deliver(&self, tag: Tag, payload: Vec<u8>) {
        let mut slots = self.slots();
        if slots.closed.contains(&tag) {
            debug!("{} message for closed tag {}, dropped", self.name, tag);
            return;
        }
        match slots.open.remove(&tag) {
            None => {
                slots.open.insert(tag, Slot::Arrived(payload, Instant::now()));
            }
            Some(Slot::Waiting(waiter)) => {
                if waiter.send(payload).is_err() {
                    debug!("{} waiter for {} is gone", self.name, tag);
                }
            }
            Some(Slot::Arrived(first, at)) => {
                warn!("duplicate {} message for {}, dropped", self.name, tag);
                slots.open.insert(tag, Slot::Arrived(first, at));
            }
        }
    }

    /// Panics if somebody already waits for `tag`.
    pub fn receive<T: DeserializeOwned>(&self, tag: Tag) -> TagReceiver<'_, T> {
        let (send, recv) = oneshot::channel();
        let mut slots = self.slots();
        slots.closed.reopen(&tag);
        match slots.open.remove(&tag) {
            Some(Slot::Arrived(payload, _)) => {
                // recv is alive, this cannot fail
                let _ = send.send(payload);
            }
            Some(Slot::Waiting(_)) => panic!("second {} waiter for tag {}", self.name, tag),
            None => {
                slots.open.insert(tag.clone(), Slot::Waiting(send));
            }
        }
        TagReceiver { mailbox: self, tag, inner: recv, phantom: PhantomData }
    }

    /// Frees `tag` and drops whatever arrives for it later.
    pub fn close(&self, tag: &str) {
        let mut slots = self.slots();
        slots.open.remove(tag);
        slots.closed.close(tag.to_string(), self.ttl);
    }

    pub fn pending(&self) -> usize {
        self.slots().open.len()
    }
}

#[must_use]
pub struct TagReceiver<'a, T> {
    mailbox: &'a Mailbox,
    tag: Tag,
    inner: oneshot::Receiver<Vec<u8>>,
    phantom: PhantomData<T>,
}

impl<'a, T: DeserializeOwned> TagReceiver<'a, T> {
    /// Waits at most `timeout`; on expiry the tag is closed.
    pub fn rcv(self, timeout: Duration) -> MpcResult<T> {
        match self.inner.recv_timeout(timeout) {
            Ok(bytes) => decode(&bytes),
            Err(RecvTimeoutError::Timeout) => {
                self.mailbox.close(&self.tag);
                Err(MpcError::Timeout { tag: self.tag, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.mailbox.close(&self.tag);
                Err(MpcError::Receive)
            }
        }
    }
}

type ChunkWaiter = (Vec<PartyId>, oneshot::Sender<Vec<Vec<u8>>>);

struct ChunkSlot {
    received: HashMap<PartyId, Vec<u8>>,
    waiter: Option<ChunkWaiter>,
    since: Instant,
}

impl ChunkSlot {
    fn new() -> Self {
        Self { received: HashMap::new(), waiter: None, since: Instant::now() }
    }
}

#[derive(Default)]
struct ChunkSlots {
    open: HashMap<Tag, ChunkSlot>,
    closed: Closed,
}

/// Collects one chunk per (tag, sender).
///
/// Chunks nobody combined within `ttl` are dropped.
pub struct ChunkMailbox {
    ttl: Duration,
    slots: Mutex<ChunkSlots>,
}

impl ChunkMailbox {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, slots: Mutex::new(ChunkSlots::default()) }
    }

    fn slots(&self) -> MutexGuard<'_, ChunkSlots> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let before = slots.open.len();
        slots.open.retain(|_, slot| slot.waiter.is_some() || now.duration_since(slot.since) < self.ttl);
        if slots.open.len() < before {
            debug!("expired {} unclaimed chunk slots", before - slots.open.len());
        }
        slots.closed.sweep(now);
        slots
    }

    pub fn deliver(&self, tag: Tag, from: PartyId, payload: Vec<u8>) {
        let mut slots = self.slots();
        if slots.closed.contains(&tag) {
            debug!("chunk from {} for closed tag {}, dropped", from, tag);
            return;
        }
        let slot = slots.open.entry(tag.clone()).or_insert_with(ChunkSlot::new);
        if slot.received.contains_key(&from) {
            warn!("duplicate chunk from {} for {}, dropped", from, tag);
            return;
        }
        slot.received.insert(from, payload);
        Self::try_resolve(&mut slots.open, &tag);
    }

    /// Panics if somebody already waits for `tag`.
    pub fn combine<T: DeserializeOwned>(&self, from: Vec<PartyId>, tag: Tag) -> ChunkReceiver<'_, T> {
        let (send, recv) = oneshot::channel();
        let mut slots = self.slots();
        slots.closed.reopen(&tag);
        let slot = slots.open.entry(tag.clone()).or_insert_with(ChunkSlot::new);
        if slot.waiter.is_some() {
            panic!("second chunk waiter for tag {}", tag);
        }
        slot.waiter = Some((from, send));
        Self::try_resolve(&mut slots.open, &tag);
        ChunkReceiver { mailbox: self, tag, inner: recv, phantom: PhantomData }
    }

    fn try_resolve(slots: &mut HashMap<Tag, ChunkSlot>, tag: &str) {
        let complete = match slots.get(tag) {
            Some(ChunkSlot { received, waiter: Some((from, _)), .. }) => from.iter().all(|id| received.contains_key(id)),
            _ => false,
        };
        if !complete {
            return;
        }
        if let Some(ChunkSlot { mut received, waiter: Some((from, waiter)), .. }) = slots.remove(tag) {
            // concatenate in the order of `from`, not by arrival
            let ordered = from.iter().filter_map(|id| received.remove(id)).collect();
            if waiter.send(ordered).is_err() {
                debug!("chunk waiter for {} is gone", tag);
            }
        }
    }

    /// Frees `tag` and drops every chunk that arrives for it later.
    pub fn close(&self, tag: &str) {
        let mut slots = self.slots();
        slots.open.remove(tag);
        slots.closed.close(tag.to_string(), self.ttl);
    }

    pub fn pending(&self) -> usize {
        self.slots().open.len()
    }
}

#[must_use]
pub struct ChunkReceiver<'a, T> {
    mailbox: &'a ChunkMailbox,
    tag: Tag,
    inner: oneshot::Receiver<Vec<Vec<u8>>>,
    phantom: PhantomData<T>,
}

impl<'a, T: DeserializeOwned> ChunkReceiver<'a, T> {
    /// Waits at most `timeout` for every chunk and returns their concatenation.
    pub fn rcv(self, timeout: Duration) -> MpcResult<Vec<T>> {
        match self.inner.recv_timeout(timeout) {
            Ok(chunks) => {
                let mut combined = Vec::new();
                for bytes in chunks {
                    combined.extend(decode::<Vec<T>>(&bytes)?);
                }
                Ok(combined)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.mailbox.close(&self.tag);
                Err(MpcError::Timeout { tag: self.tag, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.mailbox.close(&self.tag);
                Err(MpcError::Receive)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::{ChunkMailbox, Mailbox};
    use crate::network::message::encode;
    use crate::party::error::MpcError;
    use crate::party::PartyId;

    const WAIT: Duration = Duration::from_secs(5);
    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn buffered_message_resolves_immediately() {
        let mailbox = Mailbox::new("test", TTL);
        mailbox.deliver("a".to_string(), encode(&42u32).unwrap());
        assert_eq!(mailbox.receive::<u32>("a".to_string()).rcv(WAIT).unwrap(), 42);
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn waiter_resolves_on_arrival() {
        let mailbox = Mailbox::new("test", TTL);
        thread::scope(|s| {
            let h = s.spawn(|| mailbox.receive::<String>("b".to_string()).rcv(WAIT));
            thread::sleep(Duration::from_millis(50));
            mailbox.deliver("b".to_string(), encode("hello").unwrap());
            assert_eq!(h.join().unwrap().unwrap(), "hello");
        });
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn tags_do_not_cross() {
        let mailbox = Mailbox::new("test", TTL);
        mailbox.deliver("x".to_string(), encode(&1u8).unwrap());
        mailbox.deliver("y".to_string(), encode(&2u8).unwrap());
        assert_eq!(mailbox.receive::<u8>("y".to_string()).rcv(WAIT).unwrap(), 2);
        assert_eq!(mailbox.receive::<u8>("x".to_string()).rcv(WAIT).unwrap(), 1);
    }

    #[test]
    fn timeout_closes_the_tag() {
        let mailbox = Mailbox::new("test", TTL);
        let err = mailbox.receive::<u8>("late".to_string()).rcv(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, MpcError::Timeout { .. }));
        assert_eq!(mailbox.pending(), 0);
        // nobody waits any more, a late arrival is dropped
        mailbox.deliver("late".to_string(), encode(&3u8).unwrap());
        assert_eq!(mailbox.pending(), 0);
        // an explicit new waiter reopens it
        let receiver = mailbox.receive::<u8>("late".to_string());
        mailbox.deliver("late".to_string(), encode(&4u8).unwrap());
        assert_eq!(receiver.rcv(WAIT).unwrap(), 4);
    }

    #[test]
    fn unclaimed_messages_expire() {
        let mailbox = Mailbox::new("test", Duration::from_millis(20));
        mailbox.deliver("orphan".to_string(), encode(&1u8).unwrap());
        assert_eq!(mailbox.pending(), 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mailbox.pending(), 0);
        // closed tags expire too
        mailbox.close("gone");
        thread::sleep(Duration::from_millis(50));
        mailbox.deliver("gone".to_string(), encode(&2u8).unwrap());
        assert_eq!(mailbox.pending(), 1);
    }

    #[test]
    #[should_panic]
    fn second_waiter_panics() {
        let mailbox = Mailbox::new("test", TTL);
        let _first = mailbox.receive::<u8>("t".to_string());
        let _second = mailbox.receive::<u8>("t".to_string());
    }

    #[test]
    fn combine_orders_by_id_list() {
        let mailbox = ChunkMailbox::new(TTL);
        let (a, b, c) = (PartyId::new(1, 1), PartyId::new(1, 2), PartyId::new(1, 3));
        mailbox.deliver("t".to_string(), c, encode(&vec![5u32, 6]).unwrap());
        mailbox.deliver("t".to_string(), a, encode(&vec![1u32, 2]).unwrap());
        thread::scope(|s| {
            let h = s.spawn(|| mailbox.combine::<u32>(vec![a, b, c], "t".to_string()).rcv(WAIT));
            thread::sleep(Duration::from_millis(50));
            mailbox.deliver("t".to_string(), b, encode(&vec![3u32, 4]).unwrap());
            assert_eq!(h.join().unwrap().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        });
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn combine_resolves_when_already_buffered() {
        let mailbox = ChunkMailbox::new(TTL);
        let a = PartyId::new(2, 1);
        mailbox.deliver("t".to_string(), a, encode(&Vec::<u8>::new()).unwrap());
        assert!(mailbox.combine::<u8>(vec![a], "t".to_string()).rcv(WAIT).unwrap().is_empty());
    }

    #[test]
    fn combine_timeout_drops_partial_chunks() {
        let mailbox = ChunkMailbox::new(TTL);
        let (a, b) = (PartyId::new(2, 1), PartyId::new(3, 1));
        mailbox.deliver("t".to_string(), a, encode(&vec![1u8]).unwrap());
        let err = mailbox.combine::<u8>(vec![a, b], "t".to_string()).rcv(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, MpcError::Timeout { .. }));
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn chunks_after_close_are_dropped() {
        let mailbox = ChunkMailbox::new(TTL);
        let (a, b) = (PartyId::new(2, 1), PartyId::new(3, 1));
        mailbox.deliver("q".to_string(), a, encode(&vec![1u8]).unwrap());
        mailbox.close("q");
        assert_eq!(mailbox.pending(), 0);
        mailbox.deliver("q".to_string(), b, encode(&vec![2u8]).unwrap());
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn uncombined_chunks_expire() {
        let mailbox = ChunkMailbox::new(Duration::from_millis(20));
        let a = PartyId::new(2, 1);
        mailbox.deliver("q".to_string(), a, encode(&vec![1u8]).unwrap());
        assert_eq!(mailbox.pending(), 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mailbox.pending(), 0);
    }
}
