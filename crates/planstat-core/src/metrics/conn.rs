//! Per-process datagram connection to the monitoring listener.

use super::packet::{MetricsPacket, PACKET_SIZE};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::{debug, warn};

/// Fire-and-forget UDP sender.
///
/// The socket is created lazily and re-created when the calling pid differs
/// from the pid that created it, so a forked child never writes through its
/// parent's descriptor. Sockets are non-blocking; std sockets are
/// close-on-exec.
#[derive(Debug)]
pub struct MetricsConn {
    target: SocketAddr,
    socket: Option<UdpSocket>,
    pid: Option<u32>,
    sockets_opened: u64,
    sent: u64,
    dropped: u64,
}

impl MetricsConn {
    /// Connection to the listener on the loopback interface.
    pub fn new(port: u16) -> Self {
        Self::with_target(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_target(target: SocketAddr) -> Self {
        Self {
            target,
            socket: None,
            pid: None,
            sockets_opened: 0,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Pid that owns the current socket.
    pub fn owner_pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn sockets_opened(&self) -> u64 {
        self.sockets_opened
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn ensure_open(&mut self) {
        self.ensure_open_for(std::process::id());
    }

    /// Opens a socket unless `pid` already owns one.
    ///
    /// A failure leaves the connection closed until the pid changes; sends
    /// are then dropped.
    pub fn ensure_open_for(&mut self, pid: u32) {
        if self.pid == Some(pid) {
            return;
        }
        self.socket = None;
        self.pid = Some(pid);

        let bind_addr = match self.target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = match UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(e) => {
                warn!(pid, error = %e, "metrics: cannot create socket");
                return;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            warn!(pid, error = %e, "metrics: cannot make socket non-blocking");
            return;
        }

        self.sockets_opened += 1;
        self.socket = Some(socket);
    }

    /// Sends one datagram. Returns whether the whole datagram was handed to
    /// the kernel; failures are logged and dropped.
    pub fn send(&mut self, packet: &MetricsPacket) -> bool {
        self.ensure_open();
        self.send_bytes(&packet.encode())
    }

    fn send_bytes(&mut self, buf: &[u8; PACKET_SIZE]) -> bool {
        let Some(socket) = &self.socket else {
            self.dropped += 1;
            return false;
        };
        match socket.send_to(buf, self.target) {
            Ok(n) if n == buf.len() => {
                self.sent += 1;
                true
            }
            Ok(n) => {
                debug!(sent = n, expected = buf.len(), "metrics: short send");
                self.dropped += 1;
                false
            }
            Err(e) => {
                debug!(addr = %self.target, error = %e, "metrics: cannot send");
                self.dropped += 1;
                false
            }
        }
    }
}
