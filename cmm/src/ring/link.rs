use crate::core::{Direction, NodeId};
use crate::error::{ProtocolError, TransportError};
use crate::frame::{decode, encode, Destination, Frame, Message, LEN_PREFIX, MAX_FRAME_LEN};
use crate::ring::RingOrder;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{trace, warn};

const WRITE_QUEUE: usize = 256;

/// Reads one complete frame, length prefix included, without decoding it.
pub async fn read_raw<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
  let mut prefix = [0u8; LEN_PREFIX];
  r.read_exact(&mut prefix).await.map_err(eof_is_closed)?;
  let len = u32::from_be_bytes(prefix) as usize;
  if len > MAX_FRAME_LEN {
    return Err(ProtocolError::FrameTooLarge(len).into());
  }
  let mut frame = vec![0u8; LEN_PREFIX + len];
  frame[..LEN_PREFIX].copy_from_slice(&prefix);
  r.read_exact(&mut frame[LEN_PREFIX..])
    .await
    .map_err(eof_is_closed)?;
  Ok(frame)
}

pub async fn write_raw<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<(), TransportError> {
  w.write_all(frame).await?;
  w.flush().await?;
  Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, TransportError> {
  Ok(decode(&read_raw(r).await?)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), TransportError> {
  write_raw(w, &encode(frame)?).await
}

fn eof_is_closed(e: std::io::Error) -> TransportError {
  match e.kind() {
    ErrorKind::UnexpectedEof => TransportError::Closed,
    _ => TransportError::Io(e),
  }
}

/// Dials a ring neighbour and exchanges discovery frames. Returns the stream and the
/// neighbour's incarnation.
pub(crate) async fn dial(
  address: &str,
  expected: NodeId,
  hello: &Frame,
  connect_timeout: Duration,
) -> Result<(TcpStream, u32), TransportError> {
  let handshake = async {
    let mut stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, hello).await?;
    let reply = read_frame(&mut stream).await?;
    match reply.message {
      Message::Discovery(d) if reply.source == expected => Ok((stream, d.incarnation)),
      _ => Err(TransportError::Handshake(format!(
        "expected discovery from {}, got a {:?} frame from {}",
        expected,
        reply.message.frame_type(),
        reply.source
      ))),
    }
  };
  timeout(connect_timeout, handshake)
    .await
    .map_err(|_| TransportError::Timeout(connect_timeout))?
}

/// Completes the handshake of an inbound connection. Returns the stream, the peer and its
/// incarnation.
pub(crate) async fn accept(
  mut stream: TcpStream,
  order: &RingOrder,
  hello: &Frame,
  connect_timeout: Duration,
) -> Result<(TcpStream, NodeId, u32), TransportError> {
  let handshake = async {
    stream.set_nodelay(true)?;
    let first = read_frame(&mut stream).await?;
    let peer = first.source;
    let incarnation = match first.message {
      Message::Discovery(d)
        if first.destination == Destination::Peer
          && peer != order.local()
          && order.contains(peer) =>
      {
        d.incarnation
      }
      _ => {
        return Err(TransportError::Handshake(format!(
          "unexpected {:?} frame from {}",
          first.message.frame_type(),
          peer
        )))
      }
    };
    write_frame(&mut stream, hello).await?;
    Ok::<_, TransportError>((peer, incarnation))
  };
  let (peer, incarnation) = timeout(connect_timeout, handshake)
    .await
    .map_err(|_| TransportError::Timeout(connect_timeout))??;
  Ok((stream, peer, incarnation))
}

/// What link tasks report to the transport.
pub(crate) enum LinkEvent {
  Frame { link: u64, frame: Frame },
  Closed { link: u64, error: TransportError },
  Dialed {
    peer: NodeId,
    result: Result<(TcpStream, u32), TransportError>,
  },
  Accepted {
    stream: TcpStream,
    peer: NodeId,
    incarnation: u32,
  },
}

enum WriterMsg {
  Frame(Arc<Vec<u8>>),
  Flush(oneshot::Sender<()>),
}

/// One established ring connection with its reader and writer tasks. Dropping it closes the
/// connection.
pub(crate) struct Link {
  pub id: u64,
  pub peer: NodeId,
  /// `Right` for links this node dialed, `Left` for accepted ones.
  pub direction: Direction,
  queue: mpsc::Sender<WriterMsg>,
  reader: JoinHandle<()>,
  writer: JoinHandle<()>,
}
impl Link {
  pub fn spawn(
    id: u64,
    peer: NodeId,
    direction: Direction,
    stream: TcpStream,
    write_timeout: Duration,
    events: mpsc::Sender<LinkEvent>,
  ) -> Link {
    let (r, w) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
    let reader = tokio::spawn(read_loop(id, peer, r, events.clone()));
    let writer = tokio::spawn(write_loop(id, w, rx, write_timeout, events));
    Link {
      id: id,
      peer: peer,
      direction: direction,
      queue: tx,
      reader: reader,
      writer: writer,
    }
  }

  /// Queues an encoded frame. False if the queue is full or the writer is gone.
  pub fn send(&self, frame: Arc<Vec<u8>>) -> bool {
    self.queue.try_send(WriterMsg::Frame(frame)).is_ok()
  }

  /// Resolves once everything queued before it was written.
  pub fn flush(&self) -> Option<oneshot::Receiver<()>> {
    let (tx, rx) = oneshot::channel();
    self.queue.try_send(WriterMsg::Flush(tx)).ok().map(|_| rx)
  }
}
impl Drop for Link {
  fn drop(&mut self) {
    self.reader.abort();
    self.writer.abort();
  }
}

async fn read_loop(id: u64, peer: NodeId, mut r: OwnedReadHalf, events: mpsc::Sender<LinkEvent>) {
  loop {
    let raw = match read_raw(&mut r).await {
      Ok(raw) => raw,
      Err(error) => {
        let _ = events.send(LinkEvent::Closed { link: id, error: error }).await;
        return;
      }
    };
    match decode(&raw) {
      Ok(frame) => {
        trace!(peer = %peer, frame = ?frame.header(), "frame received");
        if events.send(LinkEvent::Frame { link: id, frame: frame }).await.is_err() {
          return;
        }
      }
      Err(error) => warn!(peer = %peer, error = %error, "malformed frame dropped"),
    }
  }
}

async fn write_loop(
  id: u64,
  mut w: OwnedWriteHalf,
  mut rx: mpsc::Receiver<WriterMsg>,
  write_timeout: Duration,
  events: mpsc::Sender<LinkEvent>,
) {
  while let Some(msg) = rx.recv().await {
    match msg {
      WriterMsg::Frame(frame) => {
        let error = match timeout(write_timeout, write_raw(&mut w, &frame)).await {
          Ok(Ok(())) => continue,
          Ok(Err(error)) => error,
          Err(_) => TransportError::Timeout(write_timeout),
        };
        let _ = events.send(LinkEvent::Closed { link: id, error: error }).await;
        return;
      }
      WriterMsg::Flush(done) => {
        let _ = w.flush().await;
        let _ = done.send(());
      }
    }
  }
  let _ = w.shutdown().await;
}

#[test]
fn test_raw_frames_on_a_stream() {
  use crate::frame::{NodeChange, NodeChangeCause};
  tokio_test::block_on(async {
    let frame = Frame::new(
      NodeId(101),
      Destination::Broadcast,
      NodeChange::new(NodeChangeCause::MemberJoined, NodeId(102)),
    );
    let mut bytes = Vec::new();
    write_frame(&mut bytes, &frame).await.unwrap();
    write_frame(&mut bytes, &frame).await.unwrap();
    let mut r = &bytes[..];
    assert_eq!(read_frame(&mut r).await.unwrap(), frame);
    assert_eq!(read_raw(&mut r).await.unwrap(), encode(&frame).unwrap());
    assert!(matches!(read_raw(&mut r).await, Err(TransportError::Closed)));

    let huge = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
    let mut r = &huge[..];
    assert!(matches!(
      read_raw(&mut r).await,
      Err(TransportError::Protocol(ProtocolError::FrameTooLarge(_)))
    ));
  });
}
