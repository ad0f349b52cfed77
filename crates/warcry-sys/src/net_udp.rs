// net_udp.rs — the real UDP transport
//
// socket2 handles socket creation so we can set the low-delay TOS bit and
// fall back to the next port when the default is taken. Receives run on
// the I/O thread; this adapter only drains the queue, so the game loop's
// polls never touch the kernel.

use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};

use warcry_common::error::NetError;
use warcry_common::net::{DatagramTransport, HostAddr, PollStatus};
use warcry_common::net_queue::{PacketQueue, QueuedPacket, DEFAULT_QUEUE_CAPACITY};

use crate::net_common::{host_addr_to_socket, resolve_host};
use crate::net_io_thread::{spawn_udp_io_thread, UdpIoConfig};

/// Hint routers to prioritize latency over throughput for our datagrams.
const IPTOS_LOWDELAY: u32 = 0x10;

pub struct UdpTransport {
    socket: Option<Arc<UdpSocket>>,
    queue: PacketQueue,
    /// Datagram claimed by a successful poll, handed out by the next recv.
    pending: Option<QueuedPacket>,
    shutdown: Arc<AtomicBool>,
    io_thread: Option<JoinHandle<()>>,
    port: u16,
}

impl UdpTransport {
    /// Bind the requested port, or the next one up when it is taken. Two
    /// failures abort the session.
    pub fn open(port: u16) -> Result<UdpTransport, NetError> {
        let (socket, bound_port) = match Self::open_socket(port) {
            Ok(socket) => (socket, port),
            Err(first_err) => {
                debug!("bind {port} failed ({first_err}), trying {}", port + 1);
                match Self::open_socket(port + 1) {
                    Ok(socket) => (socket, port + 1),
                    Err(_) => {
                        return Err(NetError::NoFreePort {
                            first: port,
                            second: port + 1,
                        })
                    }
                }
            }
        };
        // port 0 binds ephemerally; report what the kernel picked
        let bound_port = socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(bound_port);
        info!("udp: listening on port {bound_port}");

        let socket = Arc::new(socket);
        let queue = PacketQueue::new(DEFAULT_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let io_thread = spawn_udp_io_thread(UdpIoConfig {
            socket: Arc::clone(&socket),
            sender: queue.sender(),
            shutdown: Arc::clone(&shutdown),
        })?;

        Ok(UdpTransport {
            socket: Some(socket),
            queue,
            pending: None,
            shutdown,
            io_thread: Some(io_thread),
            port: bound_port,
        })
    }

    fn open_socket(port: u16) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(err) = socket.set_tos(IPTOS_LOWDELAY) {
            // some platforms refuse; latency is merely ordinary then
            debug!("udp: set_tos failed: {err}");
        }
        let bind: SocketAddrV4 = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&bind.into())?;
        Ok(socket.into())
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&mut self, to: HostAddr, data: &[u8]) -> io::Result<usize> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        };
        let addr = host_addr_to_socket(to);
        loop {
            match socket.send_to(data, addr) {
                Ok(sent) => return Ok(sent),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, HostAddr)> {
        let packet = match self.pending.take() {
            Some(packet) => packet,
            None => self
                .queue
                .recv()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "receive thread gone"))?,
        };
        let n = packet.data.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[..n]);
        Ok((n, packet.from))
    }

    fn poll_ready(&mut self, timeout_ms: u32) -> io::Result<PollStatus> {
        if self.pending.is_some() {
            return Ok(PollStatus::Ready);
        }
        let got = if timeout_ms == 0 {
            self.queue.try_recv()
        } else {
            self.queue.recv_timeout(timeout_ms)
        };
        match got {
            Some(packet) => {
                self.pending = Some(packet);
                Ok(PollStatus::Ready)
            }
            None => Ok(PollStatus::Idle),
        }
    }

    fn resolve(&mut self, name: &str) -> Option<u32> {
        resolve_host(name)
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> HostAddr {
        HostAddr::from_ipv4(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn datagrams_travel_between_two_transports() {
        let mut a = UdpTransport::open(0).unwrap();
        let mut b = UdpTransport::open(0).unwrap();

        a.send_to(loopback(b.local_port()), b"lockstep").unwrap();

        assert_eq!(b.poll_ready(2000).unwrap(), PollStatus::Ready);
        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"lockstep");
        assert_eq!(from.port, a.local_port());

        // nothing else waiting
        assert_eq!(b.poll_ready(0).unwrap(), PollStatus::Idle);
    }

    #[test]
    fn poll_does_not_consume() {
        let mut a = UdpTransport::open(0).unwrap();
        let mut b = UdpTransport::open(0).unwrap();

        a.send_to(loopback(b.local_port()), b"once").unwrap();
        assert_eq!(b.poll_ready(2000).unwrap(), PollStatus::Ready);
        assert_eq!(b.poll_ready(0).unwrap(), PollStatus::Ready);

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"once");
    }

    #[test]
    fn taken_port_falls_back_to_the_next() {
        let first = UdpTransport::open(46655).unwrap();
        let second = UdpTransport::open(first.local_port()).unwrap();
        assert_eq!(second.local_port(), first.local_port() + 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut transport = UdpTransport::open(0).unwrap();
        transport.close();
        transport.close();
        assert!(transport
            .send_to(loopback(1), b"x")
            .is_err_and(|e| e.kind() == io::ErrorKind::NotConnected));
    }
}
