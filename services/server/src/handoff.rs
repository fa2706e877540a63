//! Router-to-worker connection handoff.
//!
//! The router hands each accepted TCP connection to its assigned
//! worker process over a per-slot Unix datagram socket: one datagram
//! carrying the fixed handoff tag and the peer address string, with
//! the raw TCP fd attached as an `SCM_RIGHTS` control message. The
//! kernel duplicates the descriptor into the receiving process, so
//! dropping the router's copy after sending completes the ownership
//! transfer; the router never touches the connection again.
//!
//! Datagram sockets preserve message boundaries, which keeps the tag,
//! address and fd of one handoff atomic without extra framing.

use crate::{ServerError, ServerResult};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use pulse_wire::HANDOFF_TAG;
use std::io::{IoSlice, IoSliceMut};
use std::net::TcpStream as StdTcpStream;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

/// Largest handoff datagram: tag + length prefix + address text.
const HANDOFF_BUF: usize = 512;

/// Send one connection to the worker bound at `target`.
///
/// Consumes the stream; after the sendmsg the worker owns the only
/// meaningful reference and the router's descriptor is closed.
pub fn send_stream(target: &Path, stream: StdTcpStream, peer_addr: &str) -> ServerResult<()> {
    let mut buf = Vec::with_capacity(HANDOFF_TAG.len() + 2 + peer_addr.len());
    buf.extend_from_slice(HANDOFF_TAG);
    buf.extend_from_slice(&(peer_addr.len() as u16).to_le_bytes());
    buf.extend_from_slice(peer_addr.as_bytes());

    let socket = UnixDatagram::unbound()?;
    let addr = UnixAddr::new(target)?;
    let fds = [stream.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&buf)];

    sendmsg(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), Some(&addr))?;
    Ok(())
}

/// Receive one handed-off connection on a worker's datagram socket.
///
/// Blocks until a datagram arrives. Returns the reconstructed stream
/// and the peer address string the router observed.
pub fn recv_stream(socket: &UnixDatagram) -> ServerResult<(StdTcpStream, String)> {
    let mut buf = [0u8; HANDOFF_BUF];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;

        let mut fd: Option<RawFd> = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd = fds.first().copied();
            }
        }
        (msg.bytes, fd)
    };

    let fd = fd.ok_or_else(|| {
        ServerError::Handoff("handoff datagram carried no descriptor".to_string())
    })?;
    // From here on the fd is owned; wrap it before any early return.
    let stream = unsafe { StdTcpStream::from_raw_fd(fd) };

    let data = &buf[..bytes];
    if data.len() < HANDOFF_TAG.len() + 2 || &data[..HANDOFF_TAG.len()] != HANDOFF_TAG {
        return Err(ServerError::Handoff(
            "handoff datagram missing the expected tag".to_string(),
        ));
    }

    let rest = &data[HANDOFF_TAG.len()..];
    let addr_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + addr_len {
        return Err(ServerError::Handoff(
            "handoff datagram truncated".to_string(),
        ));
    }
    let peer_addr = String::from_utf8_lossy(&rest[2..2 + addr_len]).into_owned();

    Ok((stream, peer_addr))
}

/// Bind a worker's handoff socket, replacing any stale socket file
/// left by a previous incarnation of this slot.
pub fn bind_worker_socket(path: &Path) -> ServerResult<UnixDatagram> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixDatagram::bind(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_stream_survives_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("worker-0.sock");
        let receiver = bind_worker_socket(&socket_path).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();

        send_stream(&socket_path, accepted, &peer.to_string()).unwrap();

        let (mut handed, observed_addr) = recv_stream(&receiver).unwrap();
        assert_eq!(observed_addr, peer.to_string());

        // Bytes written by the original client arrive on the handed-off
        // stream, and the reverse direction works too.
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        handed.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        handed.write_all(b"pong").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_send_to_unbound_slot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("worker-9.sock");

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();

        assert!(send_stream(&missing, accepted, &peer.to_string()).is_err());
    }

    #[test]
    fn test_rebinding_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("worker-0.sock");

        let first = bind_worker_socket(&socket_path).unwrap();
        drop(first);
        // A respawned worker must be able to claim the same path.
        bind_worker_socket(&socket_path).unwrap();
    }
}
