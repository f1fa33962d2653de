//! Safe TCP bind/connect/read/write helper functions.
//!
//! Wire format is a fixed 8-byte preamble (big-endian `u32` header length,
//! big-endian `u32` body length) followed by the protobuf-encoded header
//! bytes and the raw body bytes of a `Frame`.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::messages::{Frame, Header};
use crate::utils::AcsError;

/// Receives a `Frame` from TCP readable connection `conn_read`, using
/// `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(frame)` if successful; upon returning, the read buffer holds any
///     already-received bytes of the next frame
///   - `Err(err)` if any unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u32()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and that those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire frame (note that
/// such cancellation can only happen at `.await` points), bytes already read
/// are stored in the read buffer and will continue to be appended by future
/// invocations until successful returning.
pub(crate) async fn safe_tcp_read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<Frame, AcsError>
where
    Conn: AsyncReadExt + Unpin,
{
    // read the two part lengths first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // lengths not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(AcsError::Transport(
                "connection closed mid-frame".into(),
            ));
        }
    }
    let header_len =
        u32::from_be_bytes(read_buf[0..4].try_into().unwrap()) as usize;
    let body_len =
        u32::from_be_bytes(read_buf[4..8].try_into().unwrap()) as usize;

    // then read the header and body bytes themselves
    let frame_end = 8 + header_len + body_len;
    if read_buf.capacity() < frame_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(AcsError::Transport(
                "connection closed mid-frame".into(),
            ));
        }
    }
    let header = Header::decode(&read_buf[8..8 + header_len])?;
    let body = Bytes::copy_from_slice(&read_buf[8 + header_len..frame_end]);

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > frame_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[frame_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(Frame { header, body })
}

/// Sends a `Frame` to TCP writable connection `conn_write`, using
/// `write_buf` as buffer storage for partial writes. Returns:
///   - `Ok(true)` if successful
///   - `Ok(false)` if socket full and may block; in this case, bytes of the
///     input frame are saved in the write buffer, and the next calls must
///     give arg `frame == None` to indicate retrying (typically after doing
///     a few reads on the same socket to free up some buffer space), until
///     the function returns success
///   - `Err(err)` if any unexpected error occurs
///
/// DEADLOCK AVOIDANCE: we avoid using `write_u32()` and `write_all()` here
/// because, in the case of TCP buffers being full, if both ends of the
/// connection are trying to write, they may both be blocking on either of
/// these two methods, resulting in a circular deadlock.
pub(crate) fn safe_tcp_write_frame<Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
    frame: Option<&Frame>,
) -> Result<bool, AcsError>
where
    Conn: AsRef<TcpStream>,
{
    // if last write was not successful, cannot send a new frame
    if frame.is_some() && !write_buf.is_empty() {
        return Err(AcsError::Transport(
            "attempting new frame while should retry".into(),
        ));
    } else if frame.is_none() && write_buf.is_empty() {
        return Err(AcsError::Transport(
            "attempting to retry while buffer is empty".into(),
        ));
    } else if let Some(frame) = frame {
        // sending a new frame, fill write_buf
        debug_assert_eq!(*write_buf_cursor, 0);
        let header_bytes = frame.header.encode_to_vec();
        write_buf
            .extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        write_buf.extend_from_slice(&(frame.body.len() as u32).to_be_bytes());
        debug_assert_eq!(write_buf.len(), 8);
        write_buf.extend_from_slice(&header_bytes);
        write_buf.extend_from_slice(&frame.body);
    } else {
        // retrying last unsuccessful write
        debug_assert!(*write_buf_cursor < write_buf.len());
    }

    // try until the lengths + both parts are all written
    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    // everything written, clear write_buf
    write_buf.clear();
    *write_buf_cursor = 0;

    Ok(true)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
/// Binds exactly the given address; the daemon deliberately listens on
/// loopback only.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, AcsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.set_nodelay(true)?;

        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, AcsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use crate::messages::{frames, MsgType, ReturnValue};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_over_tcp() -> Result<(), AcsError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:54611".parse()?, 0).await?;
        let conn_send = tcp_connect_with_retry("127.0.0.1:54611".parse()?, 0);
        let (conn_send, accepted) =
            tokio::join!(conn_send, listener.accept());
        let (_send_read, send_write) = conn_send?.into_split();
        let (conn_recv, _addr) = accepted?;
        let (mut recv_read, _recv_write) = conn_recv.into_split();

        let frame = frames::return_value_frame(0)?;
        assert_eq!(frame.header.msgtype, MsgType::ReturnValue as u32);
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;
        assert!(safe_tcp_write_frame(
            &mut write_buf,
            &mut write_buf_cursor,
            &send_write,
            Some(&frame),
        )?);

        let mut read_buf = BytesMut::new();
        let got = safe_tcp_read_frame(&mut read_buf, &mut recv_read).await?;
        assert_eq!(got.header, frame.header);
        assert_eq!(got.body, frame.body);
        got.check_hash()?;
        let rv = got.parse_body::<ReturnValue>()?;
        assert_eq!(rv.value, 0);
        Ok(())
    }
}
