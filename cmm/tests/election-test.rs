mod common;

use cmm::core::Direction;
use cmm::frame::{Destination, Frame, NodeChange, NodeChangeCause};
use cmm::membership::Input;
use cmm::NodeId;
use common::SimRing;
use itertools::Itertools;
use NodeChangeCause::*;

const IDS: [u16; 4] = [101, 102, 103, 104];

fn assert_consistent(ring: &SimRing) {
  for id in ring.up() {
    assert!(ring.table(id).roles_consistent(), "node {} holds overlapping roles", id);
  }
}

#[test]
fn test_simultaneous_boot_elects_lowest_ids() {
  let mut ring = SimRing::new(&IDS);
  for _ in 0..30 {
    ring.step();
    assert_consistent(&ring);
  }
  assert!(ring.converged(), "{:?}", ring.views());
  for id in IDS.iter() {
    assert_eq!(ring.roles(*id), (Some(101), Some(102)));
  }
  let changes = ring.changes(104);
  assert_eq!(
    changes.iter().filter(|c| c.0 == MemberJoined).count(),
    3,
    "{:?}",
    changes
  );
  assert!(changes.contains(&(MasterElected, 101)));
  assert!(changes.contains(&(ViceMasterElected, 102)));
  assert!(changes.contains(&(ValidCluster, 104)));
}

#[test]
fn test_boot_order_does_not_matter() {
  for order in IDS.iter().copied().permutations(IDS.len()) {
    let mut ring = SimRing::empty(&IDS, |_| {});
    for id in &order {
      ring.boot(*id, 1);
      ring.step();
      assert_consistent(&ring);
    }
    ring.run(30);
    assert!(ring.converged(), "order {:?}: {:?}", order, ring.views());
    assert_eq!(ring.roles(order[0]), (Some(101), Some(102)), "order {:?}", order);
  }
}

#[test]
fn test_master_leave_promotes_vice() {
  let mut ring = SimRing::new(&IDS);
  ring.converge();
  ring.run(10);
  for id in IDS.iter() {
    ring.take_notes(*id);
  }

  ring.leave(101);
  // The vice-master takes over without waiting.
  for id in ring.up() {
    assert_eq!(ring.roles(id).0, Some(102), "node {}", id);
  }
  ring.run(10);
  assert_consistent(&ring);
  assert!(ring.converged(), "{:?}", ring.views());
  for id in ring.up() {
    assert_eq!(ring.roles(id), (Some(102), Some(103)));
  }
  let changes = ring.changes(104);
  assert_eq!(
    &changes[..2],
    &[(MasterDemoted, 101), (MemberLeft, 101)],
    "{:?}",
    changes
  );
  assert!(changes.contains(&(MasterElected, 102)));
  assert!(changes.contains(&(ViceMasterElected, 103)));
}

#[test]
fn test_crash_is_reported_by_neighbours() {
  let mut ring = SimRing::new(&IDS);
  ring.converge();
  ring.run(10);
  for id in IDS.iter() {
    ring.take_notes(*id);
  }

  ring.crash(102);
  for id in ring.up() {
    assert!(!ring.table(id).is_alive(NodeId(102)), "node {}", id);
    assert_eq!(ring.roles(id), (Some(101), None));
    assert_eq!(ring.changes(id)[..2], [(ViceMasterDemoted, 102), (MemberLeft, 102)]);
  }
  ring.run(10);
  for id in ring.up() {
    assert_eq!(ring.roles(id), (Some(101), Some(103)));
  }
}

#[test]
fn test_silent_node_times_out() {
  let mut ring = SimRing::new(&IDS);
  ring.converge();
  // Nobody hears from 104 any more, but no link drops either.
  let now = ring.now;
  ring.membership(104).handle(Input::Leave, now);
  ring.run(4);
  assert!(ring.table(101).is_alive(NodeId(104)));
  ring.run(3);
  assert!(!ring.table(101).is_alive(NodeId(104)));
  assert!(ring.changes(101).contains(&(MemberLeft, 104)));
}

#[test]
fn test_restarted_node_rejoins_with_new_incarnation() {
  let mut ring = SimRing::new(&IDS);
  ring.converge();
  ring.crash(103);
  ring.run(2);
  ring.boot(103, 2);
  ring.run(10);
  assert!(ring.converged(), "{:?}", ring.views());
  assert_eq!(ring.table(101).node(NodeId(103)).unwrap().incarnation, 2);
  let changes = ring.changes(101);
  assert_eq!(changes.iter().filter(|c| **c == (MemberJoined, 103)).count(), 2);
}

#[test]
fn test_partitioned_masters_resolve_to_lowest_id() {
  let mut ring = SimRing::empty(&[102, 103], |c| c.min_alive = Some(1));
  ring.partitioned = true;
  ring.boot(102, 1);
  ring.boot(103, 1);
  ring.run(10);
  assert_eq!(ring.roles(102).0, Some(102));
  assert_eq!(ring.roles(103).0, Some(103));
  ring.take_notes(103);

  ring.partitioned = false;
  ring.step();
  assert_eq!(ring.roles(102).0, Some(102));
  assert_eq!(ring.roles(103).0, Some(102));
  let changes = ring.changes(103);
  assert!(changes.contains(&(MasterDemoted, 103)), "{:?}", changes);
  assert!(changes.contains(&(MasterElected, 102)), "{:?}", changes);

  ring.run(10);
  assert_consistent(&ring);
  assert!(ring.converged(), "{:?}", ring.views());
  assert_eq!(ring.roles(103), (Some(102), Some(103)));
}

#[test]
fn test_redelivered_node_change_is_idempotent() {
  let mut ring = SimRing::new(&IDS);
  ring.converge();
  ring.take_notes(101);

  let frame = Frame::new(
    NodeId(103),
    Destination::Broadcast,
    NodeChange::new(MemberLeft, NodeId(104)),
  );
  let deliver = |ring: &mut SimRing| {
    ring.input(
      101,
      Input::Frame {
        frame: frame.clone(),
        from: Direction::Right,
      },
    );
  };
  deliver(&mut ring);
  let once = ring.views();
  let first = ring.changes(101);
  assert!(first.contains(&(MemberLeft, 104)));

  deliver(&mut ring);
  assert_eq!(ring.views(), once);
  assert!(ring.changes(101).is_empty());
}
