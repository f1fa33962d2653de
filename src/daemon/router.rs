//! Daemon-side message socket with router semantics: every received frame
//! is tagged with the originating peer's identity, and replies are
//! addressed back by that identity at any later time. Peer identities are
//! assigned at accept time and never travel on the wire.

use std::net::SocketAddr;

use crate::daemon::reactor::PollItem;
use crate::messages::Frame;
use crate::utils::{
    safe_tcp_read_frame, safe_tcp_write_frame, tcp_bind_with_retry, AcsError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport identity of a connected peer.
pub type PeerId = u64;

/// Cloneable handle for addressing reply frames to connected peers. Reads
/// the peer map that the acceptor task maintains.
#[derive(Clone)]
pub(crate) struct ReplySender {
    tx_replies: flashmap::ReadHandle<PeerId, mpsc::UnboundedSender<Frame>>,
}

impl ReplySender {
    /// Queues a frame for delivery to the given peer. Fails if the peer is
    /// no longer connected.
    pub(crate) fn send_to(
        &self,
        peer: PeerId,
        frame: Frame,
    ) -> Result<(), AcsError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&peer) {
            Some(tx_reply) => {
                tx_reply
                    .send(frame)
                    .map_err(|e| AcsError::Transport(e.to_string()))?;
                Ok(())
            }
            None => logged_err!("peer {} not found among connected ones", peer),
        }
    }
}

#[cfg(test)]
impl ReplySender {
    /// Builds a sender with a single registered peer backed by a plain
    /// channel, for tests that route replies without sockets. The returned
    /// write handle must be kept alive for the map to stay readable.
    pub(crate) fn synthetic(
        peer: PeerId,
    ) -> (
        Self,
        flashmap::WriteHandle<PeerId, mpsc::UnboundedSender<Frame>>,
        mpsc::UnboundedReceiver<Frame>,
    ) {
        let (mut tx_replies_write, tx_replies_read) =
            flashmap::new::<PeerId, mpsc::UnboundedSender<Frame>>();
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = tx_replies_write.guard();
        tx_replies_guard.insert(peer, tx_reply);
        tx_replies_guard.publish();
        (
            ReplySender {
                tx_replies: tx_replies_read,
            },
            tx_replies_write,
            rx_reply,
        )
    }
}

/// The daemon-side router socket. Incoming frames from all peers funnel
/// into one queue whose depth is mirrored by a poll item, so a reactor can
/// multiplex this socket among other event sources.
pub(crate) struct RouterSocket {
    /// Receiver side of the incoming frame channel.
    rx_frame: mpsc::UnboundedReceiver<(PeerId, Frame)>,

    /// Readiness handle mirroring the incoming queue depth.
    poll_item: PollItem,

    /// Reply-addressing handle, cloneable for parts of the daemon that
    /// answer peers later than the receiving dispatch.
    reply_sender: ReplySender,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Map from peer ID -> courier task join handles, shared with the
    /// acceptor task.
    _peer_courier_handles: flashmap::ReadHandle<PeerId, JoinHandle<()>>,
}

// RouterSocket public API implementation
impl RouterSocket {
    /// Binds the listening socket and spawns the peer acceptor task.
    pub(crate) async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, AcsError> {
        let (tx_frame, rx_frame) = mpsc::unbounded_channel();
        let poll_item = PollItem::new();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<PeerId, mpsc::UnboundedSender<Frame>>();
        let (peer_courier_handles_write, peer_courier_handles_read) =
            flashmap::new::<PeerId, JoinHandle<()>>();

        let peer_listener = tcp_bind_with_retry(bind_addr, 10).await?;
        ad_info!("listening for peers on '{}'", bind_addr);

        let mut acceptor = RouterAcceptorTask::new(
            tx_frame,
            poll_item.clone(),
            tx_replies_write,
            peer_listener,
            peer_courier_handles_write,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(RouterSocket {
            rx_frame,
            poll_item,
            reply_sender: ReplySender {
                tx_replies: tx_replies_read,
            },
            _peer_acceptor_handle: peer_acceptor_handle,
            _peer_courier_handles: peer_courier_handles_read,
        })
    }

    /// Readiness handle for reactor registration.
    pub(crate) fn poll_item(&self) -> PollItem {
        self.poll_item.clone()
    }

    /// Clones a reply-addressing handle.
    pub(crate) fn reply_sender(&self) -> ReplySender {
        self.reply_sender.clone()
    }

    /// Waits for the next frame from some peer.
    #[allow(dead_code)]
    pub(crate) async fn recv(
        &mut self,
    ) -> Result<(PeerId, Frame), AcsError> {
        match self.rx_frame.recv().await {
            Some((peer, frame)) => {
                self.poll_item.take_event();
                Ok((peer, frame))
            }
            None => logged_err!("frame channel has been closed"),
        }
    }

    /// Takes the next already-queued frame if one is pending.
    pub(crate) fn try_recv(
        &mut self,
    ) -> Result<Option<(PeerId, Frame)>, AcsError> {
        match self.rx_frame.try_recv() {
            Ok((peer, frame)) => {
                self.poll_item.take_event();
                Ok(Some((peer, frame)))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Queues a reply frame for delivery to the given peer.
    pub(crate) fn send_to(
        &self,
        peer: PeerId,
        frame: Frame,
    ) -> Result<(), AcsError> {
        self.reply_sender.send_to(peer, frame)
    }
}

/// RouterSocket peer acceptor task.
struct RouterAcceptorTask {
    tx_frame: mpsc::UnboundedSender<(PeerId, Frame)>,
    poll_item: PollItem,
    tx_replies: flashmap::WriteHandle<PeerId, mpsc::UnboundedSender<Frame>>,

    peer_listener: TcpListener,
    peer_courier_handles: flashmap::WriteHandle<PeerId, JoinHandle<()>>,

    next_peer_id: PeerId,

    tx_exit: mpsc::UnboundedSender<PeerId>,
    rx_exit: mpsc::UnboundedReceiver<PeerId>,
}

impl RouterAcceptorTask {
    fn new(
        tx_frame: mpsc::UnboundedSender<(PeerId, Frame)>,
        poll_item: PollItem,
        tx_replies: flashmap::WriteHandle<
            PeerId,
            mpsc::UnboundedSender<Frame>,
        >,
        peer_listener: TcpListener,
        peer_courier_handles: flashmap::WriteHandle<PeerId, JoinHandle<()>>,
    ) -> Self {
        // peer identities are monotonically increasing and never reused
        // within one daemon lifetime
        let next_peer_id: PeerId = 1;

        // create an exit mpsc channel for getting notified about termination
        // of peer courier tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        RouterAcceptorTask {
            tx_frame,
            poll_item,
            tx_replies,
            peer_listener,
            peer_courier_handles,
            next_peer_id,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new peer connection and spawns its courier task.
    fn accept_new_peer(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        id: PeerId,
    ) -> Result<(), AcsError> {
        ad_debug!("accepted new peer {} '{}'", id, addr);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.insert(id, tx_reply);

        let mut courier = RouterCourierTask::new(
            id,
            addr,
            stream,
            self.tx_frame.clone(),
            self.poll_item.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        let peer_courier_handle =
            tokio::spawn(async move { courier.run().await });
        let mut peer_courier_handles_guard = self.peer_courier_handles.guard();
        peer_courier_handles_guard.insert(id, peer_courier_handle);

        peer_courier_handles_guard.publish();
        tx_replies_guard.publish();
        Ok(())
    }

    /// Removes handles of a disconnected peer.
    fn remove_left_peer(&mut self, id: PeerId) -> Result<(), AcsError> {
        let mut tx_replies_guard = self.tx_replies.guard();
        if !tx_replies_guard.contains_key(&id) {
            return logged_err!("peer {} not found among connected ones", id);
        }
        tx_replies_guard.remove(id);

        let mut peer_courier_handles_guard = self.peer_courier_handles.guard();
        peer_courier_handles_guard.remove(id);

        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        ad_debug!("peer_acceptor task spawned");

        loop {
            tokio::select! {
                // new peer connection
                accepted = self.peer_listener.accept() => {
                    if let Err(e) = accepted {
                        ad_warn!("error accepting peer connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_peer(
                        stream,
                        addr,
                        self.next_peer_id
                    ) {
                        ad_error!("error accepting new peer: {}", e);
                    } else {
                        self.next_peer_id += 1;
                    }
                },

                // a peer courier task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = self.remove_left_peer(id) {
                        ad_error!("error removing left peer {}: {}", id, e);
                    }
                },
            }
        }
    }
}

/// RouterSocket per-peer courier task.
struct RouterCourierTask {
    id: PeerId,
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_frame: mpsc::UnboundedSender<(PeerId, Frame)>,
    poll_item: PollItem,
    frame_buf: BytesMut,

    rx_reply: mpsc::UnboundedReceiver<Frame>,
    reply_buf: BytesMut,
    reply_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<PeerId>,
}

impl RouterCourierTask {
    fn new(
        id: PeerId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_frame: mpsc::UnboundedSender<(PeerId, Frame)>,
        poll_item: PollItem,
        rx_reply: mpsc::UnboundedReceiver<Frame>,
        tx_exit: mpsc::UnboundedSender<PeerId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        let frame_buf = BytesMut::with_capacity(8 + 1024);
        let reply_buf = BytesMut::with_capacity(8 + 1024);
        let reply_buf_cursor = 0;
        let retrying = false;

        RouterCourierTask {
            id,
            addr,
            conn_read,
            conn_write,
            tx_frame,
            poll_item,
            frame_buf,
            rx_reply,
            reply_buf,
            reply_buf_cursor,
            retrying,
            tx_exit,
        }
    }

    /// Reads a frame from given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_frame(
        frame_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<Frame, AcsError> {
        safe_tcp_read_frame(frame_buf, conn_read).await
    }

    /// Writes a reply frame through given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_frame(
        reply_buf: &mut BytesMut,
        reply_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        frame: Option<&Frame>,
    ) -> Result<bool, AcsError> {
        safe_tcp_write_frame(reply_buf, reply_buf_cursor, conn_write, frame)
    }

    /// Starts a per-peer courier task loop.
    async fn run(&mut self) {
        ad_debug!("peer_courier task for {} '{}' spawned", self.id, self.addr);

        loop {
            tokio::select! {
                // gets a reply to send to peer
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_frame(
                                &mut self.reply_buf,
                                &mut self.reply_buf_cursor,
                                &self.conn_write,
                                Some(&reply)
                            ) {
                                Ok(true) => {
                                    // reply delivered to the kernel buffer
                                }
                                Ok(false) => {
                                    ad_debug!("should start retrying reply send -> {}", self.id);
                                    self.retrying = true;
                                }
                                Err(e) => {
                                    ad_error!("error sending reply -> {}: {}", self.id, e);
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_frame(
                        &mut self.reply_buf,
                        &mut self.reply_buf_cursor,
                        &self.conn_write,
                        None
                    ) {
                        Ok(true) => {
                            ad_debug!("finished retrying last reply send -> {}", self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            ad_debug!("still should retry last reply send -> {}", self.id);
                        }
                        Err(e) => {
                            ad_error!("error retrying last reply send -> {}: {}", self.id, e);
                        }
                    }
                },

                // receives a frame from peer
                frame = Self::read_frame(&mut self.frame_buf, &mut self.conn_read) => {
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = self.tx_frame.send((self.id, frame)) {
                                ad_error!("error sending to tx_frame for {}: {}", self.id, e);
                            } else {
                                self.poll_item.add_event();
                            }
                        },
                        Err(_e) => {
                            break; // most likely the peer disconnected
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            ad_error!("error sending exit signal for {}: {}", self.id, e);
        }
        ad_debug!("peer_courier task for {} '{}' exited", self.id, self.addr);
    }
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use crate::messages::{frames, DriveAddr, MsgType, ReturnValue};
    use crate::utils::tcp_connect_with_retry;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recv_then_reply() -> Result<(), AcsError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // daemon-side
            let mut socket =
                RouterSocket::new_and_setup("127.0.0.1:54621".parse()?)
                    .await?;
            barrier2.wait().await;
            // recv request frame from peer
            let (peer, frame) = socket.recv().await?;
            assert_eq!(frame.msg_type(), Some(MsgType::AcsDismountTape));
            frame.check_hash()?;
            // send reply frame to peer
            socket.send_to(peer, frames::return_value_frame(0)?)?;
            Ok::<(), AcsError>(())
        });
        // peer-side
        barrier.wait().await;
        let conn =
            tcp_connect_with_retry("127.0.0.1:54621".parse()?, 10).await?;
        let (mut conn_read, conn_write) = conn.into_split();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;
        let frame = frames::dismount_tape_frame(
            "T00001",
            DriveAddr::new(0, 1, 2, 3),
        )?;
        assert!(safe_tcp_write_frame(
            &mut write_buf,
            &mut write_buf_cursor,
            &conn_write,
            Some(&frame),
        )?);
        let mut read_buf = BytesMut::new();
        let reply = safe_tcp_read_frame(&mut read_buf, &mut conn_read).await?;
        assert_eq!(reply.msg_type(), Some(MsgType::ReturnValue));
        reply.check_hash()?;
        assert_eq!(reply.parse_body::<ReturnValue>()?.value, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poll_item_mirrors_queue() -> Result<(), AcsError> {
        let mut socket =
            RouterSocket::new_and_setup("127.0.0.1:54622".parse()?).await?;
        let item = socket.poll_item();
        assert!(!item.has_events());

        let conn =
            tcp_connect_with_retry("127.0.0.1:54622".parse()?, 10).await?;
        let (_conn_read, conn_write) = conn.into_split();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;
        let frame = frames::heartbeat_frame(0)?;
        assert!(safe_tcp_write_frame(
            &mut write_buf,
            &mut write_buf_cursor,
            &conn_write,
            Some(&frame),
        )?);

        item.wait_events().await;
        assert!(item.has_events());
        let received = socket.try_recv()?;
        assert!(received.is_some());
        assert!(!item.has_events());
        assert!(socket.try_recv()?.is_none());
        Ok(())
    }
}
