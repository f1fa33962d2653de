//! Client proxy to the tape daemon: one TCP connection carrying one
//! request/reply exchange at a time.

use std::net::SocketAddr;

use crate::messages::{
    check_vid, frames, DriveAddr, Exception, Frame, MsgType, ReturnValue,
};
use crate::utils::{
    safe_tcp_read_frame, safe_tcp_write_frame, tcp_connect_with_retry,
    AcsError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// Connection state guarded by the proxy lock. The lock spans a full
/// request/reply exchange, keeping replies paired with their requests.
struct ProxyConn {
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

/// Client proxy to the tape daemon. Safe to share among concurrent
/// callers; exchanges are serialized on the connection lock.
pub struct AcsProxy {
    conn: Mutex<ProxyConn>,
}

impl AcsProxy {
    /// Connects to the daemon listening at the given address.
    pub async fn new_and_setup(addr: SocketAddr) -> Result<Self, AcsError> {
        let stream = tcp_connect_with_retry(addr, 10).await?;
        let (conn_read, conn_write) = stream.into_split();
        Ok(AcsProxy {
            conn: Mutex::new(ProxyConn {
                conn_read,
                conn_write,
                read_buf: BytesMut::with_capacity(8 + 1024),
                write_buf: BytesMut::with_capacity(8 + 1024),
                write_buf_cursor: 0,
            }),
        })
    }

    /// Performs one request/reply exchange under the connection lock.
    async fn call(&self, request: Frame) -> Result<Frame, AcsError> {
        let mut conn_guard = self.conn.lock().await;
        let conn = &mut *conn_guard;
        let mut sent = safe_tcp_write_frame(
            &mut conn.write_buf,
            &mut conn.write_buf_cursor,
            &conn.conn_write,
            Some(&request),
        )?;
        while !sent {
            conn.conn_write.writable().await?;
            sent = safe_tcp_write_frame(
                &mut conn.write_buf,
                &mut conn.write_buf_cursor,
                &conn.conn_write,
                None,
            )?;
        }
        safe_tcp_read_frame(&mut conn.read_buf, &mut conn.conn_read).await
    }

    /// Interprets a reply frame. Return value 0 means success; anything
    /// else is surfaced as an error.
    fn check_reply(reply: &Frame) -> Result<(), AcsError> {
        reply.check_header()?;
        reply.check_hash()?;
        match reply.msg_type() {
            Some(MsgType::ReturnValue) => {
                let rv = reply.parse_body::<ReturnValue>()?;
                if rv.value == 0 {
                    Ok(())
                } else {
                    Err(AcsError::msg(format!(
                        "Received an unexpected return value: \
                         expected=0 actual={}",
                        rv.value
                    )))
                }
            }
            Some(MsgType::Exception) => {
                let exception = reply.parse_body::<Exception>()?;
                Err(AcsError::Remote {
                    code: exception.code,
                    message: exception.message,
                })
            }
            _ => logged_err!(
                "unexpected reply message type {}",
                reply.header.msgtype
            ),
        }
    }

    /// Mounts the given volume for reading only. Resolves once the daemon
    /// reports the operation concluded.
    pub async fn mount_tape_read_only(
        &self,
        vid: &str,
        drive: DriveAddr,
    ) -> Result<(), AcsError> {
        check_vid(vid)?;
        let reply = self
            .call(frames::mount_tape_read_only_frame(vid, drive)?)
            .await?;
        Self::check_reply(&reply)
    }

    /// Mounts the given volume for reading and writing.
    pub async fn mount_tape_read_write(
        &self,
        vid: &str,
        drive: DriveAddr,
    ) -> Result<(), AcsError> {
        check_vid(vid)?;
        let reply = self
            .call(frames::mount_tape_read_write_frame(vid, drive)?)
            .await?;
        Self::check_reply(&reply)
    }

    /// Dismounts the given volume, forcibly if asked to.
    pub async fn dismount_tape(
        &self,
        vid: &str,
        drive: DriveAddr,
        force: bool,
    ) -> Result<(), AcsError> {
        check_vid(vid)?;
        let request = if force {
            frames::force_dismount_tape_frame(vid, drive)?
        } else {
            frames::dismount_tape_frame(vid, drive)?
        };
        let reply = self.call(request).await?;
        Self::check_reply(&reply)
    }

    /// Reports data-mover liveness to the daemon.
    pub async fn heartbeat(&self, bytes_moved: u64) -> Result<(), AcsError> {
        let reply = self.call(frames::heartbeat_frame(bytes_moved)?).await?;
        Self::check_reply(&reply)
    }
}

#[cfg(test)]
mod proxy_tests {
    use super::*;
    use crate::daemon::RouterSocket;
    use crate::messages::ecodes;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reply_interpretation() -> Result<(), AcsError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // daemon stand-in scripting one reply per received request
            let mut socket =
                RouterSocket::new_and_setup("127.0.0.1:54626".parse()?)
                    .await?;
            barrier2.wait().await;
            let (peer, _frame) = socket.recv().await?;
            socket.send_to(peer, frames::return_value_frame(0)?)?;
            let (peer, _frame) = socket.recv().await?;
            socket.send_to(peer, frames::return_value_frame(3)?)?;
            let (peer, _frame) = socket.recv().await?;
            socket.send_to(
                peer,
                frames::exception_frame(
                    ecodes::SETIMEDOUT,
                    "command timed out",
                )?,
            )?;
            Ok::<(), AcsError>(())
        });
        barrier.wait().await;
        let proxy =
            AcsProxy::new_and_setup("127.0.0.1:54626".parse()?).await?;
        let drive = DriveAddr::new(0, 1, 2, 3);

        proxy.mount_tape_read_write("T00001", drive).await?;
        match proxy.dismount_tape("T00001", drive, false).await {
            Err(AcsError::Msg(msg)) => {
                assert!(msg.contains("expected=0 actual=3"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        match proxy.dismount_tape("T00001", drive, true).await {
            Err(AcsError::Remote { code, message }) => {
                assert_eq!(code, ecodes::SETIMEDOUT);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // volume IDs longer than the limit never reach the wire
        assert!(proxy
            .mount_tape_read_only("VIDVID7", drive)
            .await
            .is_err());
        Ok(())
    }
}
