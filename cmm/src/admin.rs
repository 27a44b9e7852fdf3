//! Membership snapshots for tools outside the ring.
//!
//! A client connects, writes a `NodeInfo` or `CNodeInfo` query frame and reads back the response,
//! any number of times per connection. Queries are answered from the latest published table.
//! Clients are not cluster members and use [`CLIENT_ID`] as their frame source.

use crate::cluster::ClusterClient;
use crate::core::NodeId;
use crate::error::{CmmError, TransportError};
use crate::frame::{CNodeInfo, Destination, Frame, InfoRequest, Message, NodeInfo};
use crate::membership::InfoReply;
use crate::ring::{read_frame, write_frame};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The frame source used by clients that are not cluster members.
pub const CLIENT_ID: NodeId = NodeId(0);

pub async fn serve(listener: TcpListener, client: ClusterClient) {
  let local = client.local_id();
  if let Ok(addr) = listener.local_addr() {
    info!(node = %local, address = %addr, "admin server listening");
  }
  loop {
    match listener.accept().await {
      Ok((stream, addr)) => {
        let client = client.clone();
        tokio::spawn(async move {
          if let Err(error) = answer(stream, client).await {
            debug!(node = %local, client = %addr, error = %error, "admin client gone");
          }
        });
      }
      Err(error) => warn!(node = %local, error = %error, "admin accept failed"),
    }
  }
}

async fn answer(mut stream: TcpStream, client: ClusterClient) -> Result<(), TransportError> {
  let local = client.local_id();
  loop {
    let query = read_frame(&mut stream).await?;
    let snapshot = client.snapshot();
    let response: Message = match query.message {
      Message::NodeInfo(q) if !q.response => snapshot.node_info(q.request, q.given).into(),
      Message::CNodeInfo(q) if !q.response => snapshot.c_node_info(q.request, q.given).into(),
      other => {
        debug!(node = %local, frame = ?other.frame_type(), "admin request ignored");
        continue;
      }
    };
    write_frame(&mut stream, &Frame::new(local, Destination::Peer, response)).await?;
  }
}

/// Asks the admin server at `addr` for a snapshot. `legacy` selects the `CNodeInfo` layout.
pub async fn query<A: ToSocketAddrs>(
  addr: A,
  request: InfoRequest,
  given: Option<NodeId>,
  legacy: bool,
  deadline: Duration,
) -> Result<InfoReply, CmmError> {
  let exchange = async {
    let mut stream = TcpStream::connect(addr).await?;
    let message: Message = if legacy {
      CNodeInfo::query(request, given).into()
    } else {
      NodeInfo::query(request, given).into()
    };
    write_frame(&mut stream, &Frame::new(CLIENT_ID, Destination::Peer, message)).await?;
    match read_frame(&mut stream).await?.message {
      Message::NodeInfo(info) if !legacy => Ok(InfoReply::Node(info)),
      Message::CNodeInfo(info) if legacy => Ok(InfoReply::CNode(info)),
      other => Err(TransportError::Handshake(format!(
        "unexpected {:?} response",
        other.frame_type()
      ))),
    }
  };
  Ok(timeout(deadline, exchange)
    .await
    .map_err(|_| CmmError::Timeout)??)
}
