// net_io_thread.rs — background UDP receive thread
//
// Receives datagrams off the socket and enqueues them for the game thread,
// so the frame loop never blocks on the kernel. The thread polls with a
// short read timeout and exits when the shutdown flag is raised.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;
use warcry_common::net_queue::{PacketQueueSender, QueuedPacket};

use crate::net_common::socket_to_host_addr;

/// Largest datagram the protocol produces; covers command packets and
/// setup messages with room to spare.
pub const MAX_DATAGRAM: usize = 256;

/// Read timeout while polling. Shorter reacts to shutdown faster at the
/// price of more wakeups.
const IO_POLL_TIMEOUT_MS: u64 = 10;

/// Per-iteration receive cap so a flood cannot starve the shutdown check.
const MAX_PACKETS_PER_ITERATION: usize = 32;

pub struct UdpIoConfig {
    pub socket: Arc<UdpSocket>,
    pub sender: PacketQueueSender,
    pub shutdown: Arc<AtomicBool>,
}

pub fn spawn_udp_io_thread(config: UdpIoConfig) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("udp-io".into())
        .spawn(move || udp_io_loop(config))
}

fn udp_io_loop(config: UdpIoConfig) {
    let socket = &config.socket;
    let sender = &config.sender;
    let shutdown = &config.shutdown;

    if let Err(err) = socket.set_read_timeout(Some(Duration::from_millis(IO_POLL_TIMEOUT_MS))) {
        warn!("udp-io: can't set read timeout: {err}");
        return;
    }

    let mut buf = [0u8; MAX_DATAGRAM];

    while !shutdown.load(Ordering::Relaxed) {
        let mut received = 0;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((size, from_addr)) => {
                    let Some(from) = socket_to_host_addr(&from_addr) else {
                        continue;
                    };
                    // a full queue drops the packet; duplication and
                    // resends cover the loss
                    let _ = sender.try_send(QueuedPacket::new(from, buf[..size].to_vec()));
                    received += 1;
                    if received >= MAX_PACKETS_PER_ITERATION {
                        break;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !shutdown.load(Ordering::Relaxed) {
                        warn!("udp-io: receive error: {err}");
                    }
                    break;
                }
            }
        }
    }
}
