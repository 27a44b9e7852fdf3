use cmm::error::ProtocolError;
use cmm::frame::{
  decode, encode, CNodeInfo, CNodeRecord, ConfigChange, ConfigChangeNotif, ConfigFile,
  ConfigNotifCause, ConfigStatus, Destination, Discovery, Election, Frame, FrameHeader, FrameType,
  Heartbeat, InfoRequest, Md5Sum, NodeChange, NodeChangeCause, NodeInfo, NodeInfoRecord, SFlags,
  MAX_FRAME_LEN,
};
use cmm::NodeId;

fn frames() -> Vec<Frame> {
  let src = NodeId(101);
  let flags = SFlags::default()
    .with(SFlags::MASTER, true)
    .with(SFlags::ELIGIBLE, true);
  let record = NodeInfoRecord {
    id: NodeId(103),
    name: "node-103".to_string(),
    alive: true,
    eligible: false,
    master: false,
    vice_master: true,
    off: false,
    active_disks: 3,
  };
  let c_record = CNodeRecord {
    id: NodeId(104),
    name: "node-104".to_string(),
    addr: "10.0.0.4:7104".to_string(),
    domain: 0,
    sflags: flags,
    incarnation: 7,
    swload: "cmm-0.1.0".to_string(),
  };
  vec![
    Frame::new(
      src,
      Destination::Broadcast,
      Heartbeat {
        incarnation: i32::MAX as u32,
        sequence: 0,
        flags: flags,
        active_disks: 0,
      },
    ),
    Frame::new(
      src,
      Destination::Broadcast,
      Election {
        cause: NodeChangeCause::ViceMasterDemoted,
        node: src,
        incarnation: 1,
        sequence: i64::MAX as u64,
      },
    ),
    Frame::new(
      src,
      Destination::Peer,
      Discovery {
        incarnation: 2,
        address: String::new(),
      },
    ),
    Frame::new(
      src,
      Destination::Broadcast,
      NodeChange::new(NodeChangeCause::LostQuorum, NodeId(u16::MAX)),
    ),
    Frame::new(
      src,
      Destination::Node(NodeId(102)),
      NodeInfo::query(InfoRequest::GivenNode, Some(NodeId(103))),
    ),
    Frame::new(
      src,
      Destination::Node(NodeId(102)),
      NodeInfo::answer(InfoRequest::All, None, vec![record.clone(), record]),
    ),
    Frame::new(
      src,
      Destination::Peer,
      NodeInfo::count_only(4),
    ),
    Frame::new(
      src,
      Destination::Node(NodeId(102)),
      CNodeInfo::answer(InfoRequest::Me, None, vec![c_record]),
    ),
    Frame::new(
      src,
      Destination::Broadcast,
      ConfigChange {
        source: src,
        file: ConfigFile::Multicell,
        clear_mode: true,
        version: Some(0),
        md5: Md5Sum::default(),
        status: ConfigStatus::Failure,
        error_code: -3,
      },
    ),
    Frame::new(
      src,
      Destination::Peer,
      ConfigChangeNotif {
        cause: ConfigNotifCause::ConfigFailed,
        node: NodeId(102),
        file: ConfigFile::Silo,
      },
    ),
  ]
}

#[test]
fn test_every_frame_type_round_trips() {
  let frames = frames();
  let mut types = frames.iter().map(|f| f.message.frame_type()).collect::<Vec<_>>();
  types.dedup();
  assert_eq!(types.len(), 8);
  for frame in frames {
    let bytes = encode(&frame).unwrap();
    let header = FrameHeader::peek(&bytes).unwrap();
    assert_eq!(header, frame.header());
    assert_eq!(decode(&bytes).unwrap(), frame);
  }
}

#[test]
fn test_config_change_version_must_be_set() {
  let mut change = ConfigChange {
    source: NodeId(102),
    file: ConfigFile::Cluster,
    clear_mode: false,
    version: None,
    md5: "d41d8cd98f00b204e9800998ecf8427e".parse().unwrap(),
    status: ConfigStatus::Pending,
    error_code: 0,
  };
  let frame = Frame::new(NodeId(102), Destination::Broadcast, change.clone());
  match encode(&frame) {
    Err(ProtocolError::Unset("version")) => {}
    other => panic!("expected an unset version error, got {:?}", other),
  }

  change.version = Some(5);
  let frame = Frame::new(NodeId(102), Destination::Broadcast, change);
  let decoded = decode(&encode(&frame).unwrap()).unwrap();
  assert_eq!(decoded, frame);
  match decoded.message {
    cmm::frame::Message::ConfigChange(c) => {
      assert_eq!(c.version, Some(5));
      assert_eq!(c.md5.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }
    other => panic!("decoded {:?}", other),
  }
}

#[test]
fn test_legacy_unset_given_node() {
  let frame = Frame::new(
    NodeId(101),
    Destination::Peer,
    NodeInfo::query(InfoRequest::GivenNode, None),
  );
  assert!(matches!(encode(&frame), Err(ProtocolError::Unset(_))));
  let frame = Frame::new(
    NodeId(101),
    Destination::Peer,
    NodeChange {
      cause: NodeChangeCause::MemberJoined,
      node: None,
    },
  );
  assert!(matches!(encode(&frame), Err(ProtocolError::Unset(_))));
}

#[test]
fn test_malformed_frames_are_rejected() {
  let frame = Frame::new(
    NodeId(101),
    Destination::Broadcast,
    NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)),
  );
  let bytes = encode(&frame).unwrap();

  // Every strict prefix is refused, never misread.
  for cut in 0..bytes.len() {
    assert!(decode(&bytes[..cut]).is_err(), "prefix of {} bytes decoded", cut);
  }

  let mut unknown = bytes.clone();
  unknown[4..8].copy_from_slice(&99i32.to_be_bytes());
  assert!(matches!(decode(&unknown), Err(ProtocolError::UnknownFrameType(99))));

  let mut cause = bytes.clone();
  let at = bytes.len() - 8;
  cause[at..at + 4].copy_from_slice(&0i32.to_be_bytes());
  assert!(matches!(
    decode(&cause),
    Err(ProtocolError::InvalidValue { field: "cause", .. })
  ));

  let mut huge = bytes;
  huge[..4].copy_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
  assert!(matches!(decode(&huge), Err(ProtocolError::FrameTooLarge(_))));
}

#[test]
fn test_oversized_frame_refuses_to_encode() {
  let records = (1..=5000)
    .map(|i| CNodeRecord {
      id: NodeId(i),
      name: format!("node-{}", i),
      addr: String::new(),
      domain: 0,
      sflags: SFlags::default(),
      incarnation: 1,
      swload: String::new(),
    })
    .collect();
  let frame = Frame::new(
    NodeId(101),
    Destination::Peer,
    CNodeInfo::answer(InfoRequest::All, None, records),
  );
  assert!(matches!(encode(&frame), Err(ProtocolError::FrameTooLarge(_))));
}

#[test]
fn test_frame_types_have_stable_tags() {
  let tags = [
    (FrameType::Heartbeat, 1),
    (FrameType::Election, 2),
    (FrameType::Discovery, 3),
    (FrameType::NodeChange, 4),
    (FrameType::NodeInfo, 5),
    (FrameType::CNodeInfo, 6),
    (FrameType::ConfigChange, 7),
    (FrameType::ConfigChangeNotif, 8),
  ];
  for (t, tag) in tags.iter() {
    assert_eq!(i32::from(*t), *tag);
  }
}
