use crate::core::Direction;
use linked_hash_map::LinkedHashMap;
use std::time::{Duration, Instant};

/// How a heartbeat relates to what was last seen from its sender.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Freshness {
  /// Older than, or equal to, something already applied. Dropped and not forwarded.
  Stale,
  Fresh,
  /// The sender restarted since it was last heard from.
  NewIncarnation,
}

/// Liveness bookkeeping for one remote node: the newest `(incarnation, sequence)` applied and
/// when it was last heard from.
#[derive(Clone, Debug)]
pub struct PeerTracker {
  incarnation: u32,
  last_seq: u64,
  last_heard: Instant,
  departed: Option<u32>,
}
impl PeerTracker {
  pub fn new(now: Instant) -> PeerTracker {
    PeerTracker {
      incarnation: 0,
      last_seq: 0,
      last_heard: now,
      departed: None,
    }
  }

  /// Records a heartbeat if it is newer than everything applied so far.
  pub fn observe(&mut self, incarnation: u32, sequence: u64, now: Instant) -> Freshness {
    if self.departed == Some(incarnation) || incarnation < self.incarnation {
      return Freshness::Stale;
    }
    let freshness = if incarnation > self.incarnation {
      Freshness::NewIncarnation
    } else if sequence > self.last_seq {
      Freshness::Fresh
    } else {
      return Freshness::Stale;
    };
    self.incarnation = incarnation;
    self.last_seq = sequence;
    self.last_heard = now;
    freshness
  }

  /// Advances the sequence floor without counting as a heartbeat. Role changes carry the
  /// sender's sequence so heartbeats sent before them are recognised as stale.
  pub fn raise(&mut self, incarnation: u32, sequence: u64) {
    if incarnation == self.incarnation && sequence > self.last_seq {
      self.last_seq = sequence;
    }
  }

  /// The sender left gracefully; heartbeats of this incarnation are ignored from now on.
  pub fn depart(&mut self, incarnation: u32) {
    self.departed = Some(incarnation);
  }

  pub fn incarnation(&self) -> u32 {
    self.incarnation
  }

  pub fn silent_for(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.last_heard)
  }
}

#[derive(Clone, Copy, Debug, Default)]
struct Arrivals {
  left: u32,
  right: u32,
}
impl Arrivals {
  fn unpaired(&mut self, from: Direction) -> &mut u32 {
    match from {
      Direction::Left => &mut self.left,
      Direction::Right => &mut self.right,
    }
  }
}

/// Pairs up the two copies of a frame that travel the ring in opposite directions.
///
/// A frame originated with [`Route::Both`](crate::core::Route::Both) can reach a node once from
/// each side. An arrival is a duplicate only if it pairs with an unpaired arrival of the same
/// digest from the other side; a repeat from the same side is a new send of an identical frame,
/// such as a repeated query. Entries are kept in insertion order, which is also expiry order.
pub struct SeenCache {
  window: Duration,
  seen: LinkedHashMap<u64, (Instant, Arrivals)>,
}
impl SeenCache {
  pub fn new(window: Duration) -> SeenCache {
    SeenCache {
      window: window,
      seen: LinkedHashMap::new(),
    }
  }

  /// Returns true if the arrival should be applied.
  pub fn insert(&mut self, digest: u64, from: Direction, now: Instant) -> bool {
    self.expire(now);
    let (_, arrivals) = self
      .seen
      .entry(digest)
      .or_insert_with(|| (now, Arrivals::default()));
    let other = arrivals.unpaired(from.opposite());
    if *other > 0 {
      *other -= 1;
      return false;
    }
    *arrivals.unpaired(from) += 1;
    true
  }

  pub fn expire(&mut self, now: Instant) {
    while let Some((_, (at, _))) = self.seen.front() {
      if now.saturating_duration_since(*at) < self.window {
        break;
      }
      self.seen.pop_front();
    }
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}

#[test]
fn test_tracker_ordering() {
  let t0 = Instant::now();
  let mut t = PeerTracker::new(t0);
  assert_eq!(t.observe(5, 1, t0), Freshness::NewIncarnation);
  assert_eq!(t.observe(5, 1, t0), Freshness::Stale);
  assert_eq!(t.observe(5, 3, t0), Freshness::Fresh);
  assert_eq!(t.observe(5, 2, t0), Freshness::Stale);
  assert_eq!(t.observe(4, 9, t0), Freshness::Stale);
  t.raise(5, 10);
  assert_eq!(t.observe(5, 10, t0), Freshness::Stale);
  assert_eq!(t.observe(5, 11, t0), Freshness::Fresh);
  t.depart(5);
  assert_eq!(t.observe(5, 12, t0), Freshness::Stale);
  assert_eq!(t.observe(6, 1, t0), Freshness::NewIncarnation);
  assert_eq!(t.incarnation(), 6);
}

#[test]
fn test_seen_cache_pairs_opposite_copies() {
  use Direction::*;
  let t0 = Instant::now();
  let window = Duration::from_millis(100);
  let mut cache = SeenCache::new(window);
  assert!(cache.insert(1, Left, t0));
  assert!(!cache.insert(1, Right, t0));
  assert!(cache.insert(1, Left, t0 + window / 4));
  assert!(cache.insert(1, Left, t0 + window / 4));
  assert!(!cache.insert(1, Right, t0 + window / 2));
  assert!(!cache.insert(1, Right, t0 + window / 2));
  assert!(cache.insert(1, Right, t0 + window / 2));
  assert!(cache.insert(2, Right, t0 + window / 2));
  assert!(cache.insert(1, Left, t0 + window));
  assert_eq!(cache.len(), 2);
  cache.expire(t0 + window * 3);
  assert!(cache.is_empty());
}
