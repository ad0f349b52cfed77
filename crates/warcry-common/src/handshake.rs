// handshake.rs — peer discovery and session setup
//
// One wire protocol, two roles. Clients send InitHello to the host until
// answered; the host collects the expected number of distinct peers,
// assigns player numbers from the simulation's table, and broadcasts an
// InitConfig carrying the full host table until every client acks it.
// Both sides come out with the same sealed roster.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::error::{NetError, WireError};
use crate::game_api::PlayerKind;
use crate::net::{DatagramTransport, HostAddr, PollStatus};
use crate::proto::{
    decode_init, encode_init, InitMessage, MessageType, DEFAULT_PORT, INIT_WIRE_SIZE, MAX_PLAYERS,
    PROTOCOL_VERSION,
};

pub const DEFAULT_LAG: u32 = 10;
pub const DEFAULT_UPDATES: u32 = 5;

/// Host polls this long for config acks before re-broadcasting.
const ACK_POLL_MS: u32 = 500;
/// Client waits this long for the reply to one hello before re-sending.
const REPLY_WAIT_MS: u32 = 1000;
/// Quiet period both sides observe to absorb lost final acks.
#[cfg(not(test))]
const TAIL_WAIT_MS: u32 = 3000;
#[cfg(test)]
const TAIL_WAIT_MS: u32 = 60;

/// Session parameters every peer must agree on, frozen after setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Frames between issuing a command and executing it.
    pub lag: u32,
    /// Commit cadence: commands transmit and execute every `updates` frames.
    pub updates: u32,
}

impl SessionParams {
    /// Lag is quantized down to a multiple of the cadence; frame-number
    /// reconstruction depends on this.
    pub fn new(lag: u32, updates: u32) -> Self {
        let updates = updates.max(1);
        let lag = (lag / updates) * updates;
        Self { lag, updates }
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self::new(DEFAULT_LAG, DEFAULT_UPDATES)
    }
}

/// One session participant. The local player's entry has an unset address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RosterEntry {
    pub addr: HostAddr,
    pub player: u8,
}

/// The sealed participant list plus the local player's number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
    this_player: u8,
}

impl Roster {
    /// Entries are ordered by player number so every peer holds the same
    /// roster regardless of join order.
    pub fn new(mut entries: Vec<RosterEntry>, this_player: u8) -> Self {
        entries.sort_by_key(|e| e.player);
        Self {
            entries,
            this_player,
        }
    }

    pub fn solo(this_player: u8) -> Self {
        Self {
            entries: vec![RosterEntry {
                addr: HostAddr::UNSET,
                player: this_player,
            }],
            this_player,
        }
    }

    pub fn this_player(&self) -> u8 {
        self.this_player
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    /// Every participant we can reach over the wire.
    pub fn remotes(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter().filter(|e| !e.addr.is_unset())
    }

    pub fn remote_players(&self) -> Vec<u8> {
        self.remotes().map(|e| e.player).collect()
    }

    pub fn is_remote_player(&self, player: u8) -> bool {
        self.remotes().any(|e| e.player == player)
    }
}

// ============================================================
// Shared receive helpers
// ============================================================

fn send_init(
    transport: &mut dyn DatagramTransport,
    to: HostAddr,
    msg: &InitMessage,
) -> Result<(), NetError> {
    let mut buf = [0u8; INIT_WIRE_SIZE];
    encode_init(msg, &mut buf);
    transport.send_to(to, &buf)?;
    Ok(())
}

/// Blocking receive of the next parseable init message. A hello with the
/// wrong protocol version is fatal; other malformed datagrams are dropped.
fn recv_init(transport: &mut dyn DatagramTransport) -> Result<(InitMessage, HostAddr), NetError> {
    let mut buf = [0u8; INIT_WIRE_SIZE];
    loop {
        let (len, from) = transport.recv_from(&mut buf)?;
        match decode_init(&buf[..len]) {
            Ok(msg) => return Ok((msg, from)),
            Err(WireError::BadVersion { got }) => {
                return Err(NetError::VersionMismatch {
                    got,
                    want: PROTOCOL_VERSION,
                })
            }
            Err(err) => debug!("setup: dropping malformed datagram from {from}: {err}"),
        }
    }
}

/// Non-fatal receive used once the roster is validated; anything that does
/// not parse is dropped, version problems included.
fn try_recv_init(
    transport: &mut dyn DatagramTransport,
) -> Result<Option<(InitMessage, HostAddr)>, NetError> {
    let mut buf = [0u8; INIT_WIRE_SIZE];
    let (len, from) = transport.recv_from(&mut buf)?;
    match decode_init(&buf[..len]) {
        Ok(msg) => Ok(Some((msg, from))),
        Err(err) => {
            debug!("setup: dropping malformed datagram from {from}: {err}");
            Ok(None)
        }
    }
}

// ============================================================
// Host side
// ============================================================

/// Collect `net_players - 1` clients, assign player numbers, distribute the
/// configuration, and wait until everyone acked it.
pub fn server_setup(
    transport: &mut dyn DatagramTransport,
    params: &SessionParams,
    net_players: u8,
    player_kinds: &[PlayerKind],
) -> Result<Roster, NetError> {
    let expected = net_players.saturating_sub(1) as usize;
    let mut clients: Vec<HostAddr> = Vec::new();

    //
    // Wait for all clients to say hello.
    //
    while clients.len() < expected {
        let (msg, from) = recv_init(transport)?;
        if msg.msg_type != MessageType::InitHello as u8 {
            debug!("setup: ignoring message type {} from {from}", msg.msg_type);
            continue;
        }
        if msg.lag != params.lag as i32 {
            return Err(NetError::LagMismatch {
                got: msg.lag,
                want: params.lag as i32,
            });
        }
        if msg.updates != params.updates as i32 {
            return Err(NetError::UpdatesMismatch {
                got: msg.updates,
                want: params.updates as i32,
            });
        }

        if !clients.contains(&from) {
            info!("setup: new client {from}");
            clients.push(from);
        } else {
            debug!("setup: repeated hello from {from}, reply must have been lost");
        }
        // ack either way
        send_init(
            transport,
            from,
            &InitMessage::new(MessageType::InitReply, params.lag, params.updates),
        )?;
    }

    //
    // Assign player numbers: walk the simulation's table in order, host
    // takes the first human slot, clients follow in join order.
    //
    let mut assigned: Vec<u8> = Vec::new();
    for (i, kind) in player_kinds.iter().enumerate() {
        if assigned.len() == net_players as usize {
            break;
        }
        if *kind == PlayerKind::Human {
            assigned.push(i as u8);
        }
    }
    if assigned.len() < net_players as usize {
        return Err(NetError::NotEnoughSlots {
            wanted: net_players,
        });
    }
    info!("setup: host plays {}", assigned[0]);

    //
    // Build the configuration. The host's own slot keeps the zero address
    // as the sentinel; each recipient additionally sees its own slot
    // zeroed so it can recognize itself.
    //
    let mut config = InitMessage::new(MessageType::InitConfig, params.lag, params.updates);
    config.hosts_count = (clients.len() + 1) as i8;
    for (i, addr) in clients.iter().enumerate() {
        config.hosts[i] = *addr;
        config.nums[i] = assigned[i + 1] as i8;
    }
    config.nums[clients.len()] = assigned[0] as i8;

    //
    // Broadcast until every client acked.
    //
    let mut pending = vec![true; clients.len()];
    while pending.iter().any(|&p| p) {
        for (i, addr) in clients.iter().enumerate() {
            if !pending[i] {
                continue;
            }
            let mut msg = config;
            msg.hosts[i] = HostAddr::UNSET;
            send_init(transport, *addr, &msg)?;
        }

        while transport.poll_ready(ACK_POLL_MS)? == PollStatus::Ready {
            let Some((msg, from)) = try_recv_init(transport)? else {
                continue;
            };
            if msg.msg_type == MessageType::InitHello as u8 {
                debug!("setup: late hello from {from}, acking again");
                send_init(
                    transport,
                    from,
                    &InitMessage::new(MessageType::InitReply, params.lag, params.updates),
                )?;
            } else if msg.msg_type == MessageType::InitReply as u8 {
                if let Some(i) = clients.iter().position(|c| *c == from) {
                    if pending[i] {
                        debug!("setup: config acked by {from}");
                        pending[i] = false;
                    }
                }
            }
        }
    }

    // cover clients whose final ack we might re-trigger
    thread::sleep(Duration::from_millis(TAIL_WAIT_MS as u64));

    let mut entries = vec![RosterEntry {
        addr: HostAddr::UNSET,
        player: assigned[0],
    }];
    for (i, addr) in clients.iter().enumerate() {
        entries.push(RosterEntry {
            addr: *addr,
            player: assigned[i + 1],
        });
    }
    Ok(Roster::new(entries, assigned[0]))
}

// ============================================================
// Client side
// ============================================================

/// Split a `host[:port]` argument. A missing or unparseable port falls
/// back to the default.
pub fn split_server_arg(arg: &str) -> (&str, u16) {
    match arg.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => {
                debug!("setup: bad port in {arg:?}, using {DEFAULT_PORT}");
                (host, DEFAULT_PORT)
            }
        },
        None => (arg, DEFAULT_PORT),
    }
}

/// Announce ourselves to the host at `server_arg`, then wait for the
/// configuration naming every peer and our own player number.
pub fn client_setup(
    transport: &mut dyn DatagramTransport,
    params: &SessionParams,
    server_arg: &str,
) -> Result<Roster, NetError> {
    let (name, port) = split_server_arg(server_arg);
    let host = transport
        .resolve(name)
        .ok_or_else(|| NetError::UnresolvableHost(name.to_string()))?;
    let server = HostAddr::new(host, port);
    info!("setup: connecting to {server}");

    //
    // Hello until the host answers.
    //
    let hello = InitMessage::new(MessageType::InitHello, params.lag, params.updates);
    loop {
        send_init(transport, server, &hello)?;
        if transport.poll_ready(REPLY_WAIT_MS)? == PollStatus::Ready {
            if let Some((msg, from)) = try_recv_init(transport)? {
                if from == server && msg.msg_type == MessageType::InitReply as u8 {
                    break;
                }
                debug!("setup: unexpected message from {from} while waiting for reply");
            }
        }
    }

    //
    // Wait for the configuration from the same peer.
    //
    let roster = loop {
        let (msg, from) = recv_init(transport)?;
        if from != server || msg.msg_type != MessageType::InitConfig as u8 {
            debug!("setup: unexpected message from {from} while waiting for config");
            continue;
        }
        let total = msg.hosts_count as usize;
        if total < 2 || total > MAX_PLAYERS {
            debug!("setup: config with bad host count {total}");
            continue;
        }

        let mut this_player = None;
        let mut entries = Vec::new();
        for i in 0..total - 1 {
            let player = msg.nums[i] as u8;
            if msg.hosts[i].is_unset() {
                // our own slot, zeroed by the host
                this_player = Some(player);
                entries.push(RosterEntry {
                    addr: HostAddr::UNSET,
                    player,
                });
            } else {
                entries.push(RosterEntry {
                    addr: msg.hosts[i],
                    player,
                });
            }
        }
        // the final slot is the host itself; we know its address already
        entries.push(RosterEntry {
            addr: server,
            player: msg.nums[total - 1] as u8,
        });

        let Some(this_player) = this_player else {
            debug!("setup: config without our slot");
            continue;
        };
        info!("setup: playing {this_player}");

        send_init(
            transport,
            from,
            &InitMessage::new(MessageType::InitReply, params.lag, params.updates),
        )?;
        break Roster::new(entries, this_player);
    };

    //
    // Ack any re-sent config until the host goes quiet.
    //
    while transport.poll_ready(TAIL_WAIT_MS)? == PollStatus::Ready {
        if let Some((msg, from)) = try_recv_init(transport)? {
            if msg.msg_type == MessageType::InitConfig as u8 {
                debug!("setup: config re-sent, acking again");
                send_init(
                    transport,
                    from,
                    &InitMessage::new(MessageType::InitReply, params.lag, params.updates),
                )?;
            }
        }
    }

    Ok(roster)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::net::Ipv4Addr;

    use crossbeam::channel::{unbounded, Receiver, Sender};

    type Datagram = (HostAddr, Vec<u8>);

    /// In-memory transport mesh; every endpoint can reach every other.
    struct ChannelTransport {
        addr: HostAddr,
        incoming: Receiver<Datagram>,
        peers: HashMap<HostAddr, Sender<Datagram>>,
        pending: Option<Datagram>,
    }

    impl DatagramTransport for ChannelTransport {
        fn send_to(&mut self, to: HostAddr, data: &[u8]) -> io::Result<usize> {
            if let Some(tx) = self.peers.get(&to) {
                let _ = tx.send((self.addr, data.to_vec()));
            }
            Ok(data.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, HostAddr)> {
            let (from, data) = match self.pending.take() {
                Some(p) => p,
                None => self
                    .incoming
                    .recv()
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mesh closed"))?,
            };
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, from))
        }

        fn poll_ready(&mut self, timeout_ms: u32) -> io::Result<PollStatus> {
            if self.pending.is_some() {
                return Ok(PollStatus::Ready);
            }
            let got = if timeout_ms == 0 {
                self.incoming.try_recv().ok()
            } else {
                self.incoming
                    .recv_timeout(Duration::from_millis(timeout_ms as u64))
                    .ok()
            };
            match got {
                Some(p) => {
                    self.pending = Some(p);
                    Ok(PollStatus::Ready)
                }
                None => Ok(PollStatus::Idle),
            }
        }

        fn resolve(&mut self, name: &str) -> Option<u32> {
            name.parse::<Ipv4Addr>().ok().map(u32::from)
        }

        fn close(&mut self) {}
    }

    fn mesh(addrs: &[HostAddr]) -> Vec<ChannelTransport> {
        let channels: Vec<(Sender<Datagram>, Receiver<Datagram>)> =
            addrs.iter().map(|_| unbounded()).collect();
        addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| ChannelTransport {
                addr: *addr,
                incoming: channels[i].1.clone(),
                peers: addrs
                    .iter()
                    .zip(&channels)
                    .map(|(a, (tx, _))| (*a, tx.clone()))
                    .collect(),
                pending: None,
            })
            .collect()
    }

    fn addr(last_octet: u8) -> HostAddr {
        HostAddr::from_ipv4(Ipv4Addr::new(10, 0, 0, last_octet), DEFAULT_PORT)
    }

    #[test]
    fn params_are_quantized() {
        let params = SessionParams::new(13, 5);
        assert_eq!(params.lag, 10);
        assert_eq!(params.updates, 5);

        let params = SessionParams::new(10, 0);
        assert_eq!(params.updates, 1);
        assert_eq!(params.lag, 10);
    }

    #[test]
    fn server_arg_splitting() {
        assert_eq!(split_server_arg("10.0.0.1"), ("10.0.0.1", DEFAULT_PORT));
        assert_eq!(split_server_arg("10.0.0.1:7000"), ("10.0.0.1", 7000));
        assert_eq!(split_server_arg("hill:nonsense"), ("hill", DEFAULT_PORT));
    }

    #[test]
    fn two_peer_handshake() {
        let mut transports = mesh(&[addr(1), addr(2)]);
        let mut client_transport = transports.pop().unwrap();
        let mut server_transport = transports.pop().unwrap();

        let params = SessionParams::new(10, 5);
        let kinds = [PlayerKind::Human, PlayerKind::Human, PlayerKind::Computer];

        let server = std::thread::spawn(move || {
            server_setup(&mut server_transport, &params, 2, &kinds).unwrap()
        });
        let client_roster = client_setup(&mut client_transport, &params, "10.0.0.1").unwrap();
        let server_roster = server.join().unwrap();

        // host takes the first human slot, the client the second
        assert_eq!(server_roster.this_player(), 0);
        assert_eq!(client_roster.this_player(), 1);
        assert_eq!(server_roster.entries().len(), 2);
        assert_eq!(client_roster.entries().len(), 2);

        // each side sees the other as its only remote
        assert_eq!(server_roster.remote_players(), vec![1]);
        assert_eq!(client_roster.remote_players(), vec![0]);
        let server_entry = client_roster.remotes().next().unwrap();
        assert_eq!(server_entry.addr, addr(1));

        // player numbering agrees
        let players: Vec<u8> = server_roster.entries().iter().map(|e| e.player).collect();
        assert_eq!(players, vec![0, 1]);
    }

    #[test]
    fn three_peer_handshake() {
        let mut transports = mesh(&[addr(1), addr(2), addr(3)]);
        let mut t3 = transports.pop().unwrap();
        let mut t2 = transports.pop().unwrap();
        let mut t1 = transports.pop().unwrap();

        let params = SessionParams::default();
        let kinds = [PlayerKind::Human; 4];

        let server =
            std::thread::spawn(move || server_setup(&mut t1, &params, 3, &kinds).unwrap());
        let client_a =
            std::thread::spawn(move || client_setup(&mut t2, &params, "10.0.0.1").unwrap());
        let client_b =
            std::thread::spawn(move || client_setup(&mut t3, &params, "10.0.0.1").unwrap());

        let server_roster = server.join().unwrap();
        let roster_a = client_a.join().unwrap();
        let roster_b = client_b.join().unwrap();

        assert_eq!(server_roster.this_player(), 0);
        let mut client_players = vec![roster_a.this_player(), roster_b.this_player()];
        client_players.sort();
        assert_eq!(client_players, vec![1, 2]);

        for roster in [&server_roster, &roster_a, &roster_b] {
            assert_eq!(roster.entries().len(), 3);
            let players: Vec<u8> = roster.entries().iter().map(|e| e.player).collect();
            assert_eq!(players, vec![0, 1, 2]);
        }

        // clients know each other's address from the config relay
        assert!(roster_a.remotes().any(|e| e.addr == addr(3)));
        assert!(roster_b.remotes().any(|e| e.addr == addr(2)));
    }

    #[test]
    fn duplicate_hello_counts_once() {
        let mut transports = mesh(&[addr(1), addr(2), addr(3)]);
        let mut t3 = transports.pop().unwrap();
        let mut t2 = transports.pop().unwrap();
        let mut t1 = transports.pop().unwrap();

        let params = SessionParams::default();
        let server_addr = addr(1);

        // scripted client whose first reply "got lost": hellos twice
        let noisy = std::thread::spawn(move || {
            let hello = InitMessage::new(MessageType::InitHello, params.lag, params.updates);
            send_init(&mut t2, server_addr, &hello).unwrap();
            send_init(&mut t2, server_addr, &hello).unwrap();
            let mut buf = [0u8; INIT_WIRE_SIZE];
            loop {
                let (len, _) = t2.recv_from(&mut buf).unwrap();
                let msg = decode_init(&buf[..len]).unwrap();
                if msg.msg_type == MessageType::InitConfig as u8 {
                    let ack =
                        InitMessage::new(MessageType::InitReply, params.lag, params.updates);
                    send_init(&mut t2, server_addr, &ack).unwrap();
                    break;
                }
            }
        });
        let quiet =
            std::thread::spawn(move || client_setup(&mut t3, &params, "10.0.0.1").unwrap());

        let kinds = [PlayerKind::Human; 3];
        let roster = server_setup(&mut t1, &params, 3, &kinds).unwrap();
        noisy.join().unwrap();
        quiet.join().unwrap();

        // the double hello did not eat the third seat
        assert_eq!(roster.entries().len(), 3);
        assert!(roster.remotes().any(|e| e.addr == addr(2)));
        assert!(roster.remotes().any(|e| e.addr == addr(3)));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut transports = mesh(&[addr(1), addr(2)]);
        let mut client = transports.pop().unwrap();
        let mut server = transports.pop().unwrap();

        let params = SessionParams::default();
        let mut hello = InitMessage::new(MessageType::InitHello, params.lag, params.updates);
        hello.version = PROTOCOL_VERSION + 7;
        send_init(&mut client, addr(1), &hello).unwrap();

        let kinds = [PlayerKind::Human; 2];
        let err = server_setup(&mut server, &params, 2, &kinds).unwrap_err();
        assert!(matches!(err, NetError::VersionMismatch { got, .. } if got == PROTOCOL_VERSION + 7));
    }

    #[test]
    fn param_mismatch_is_fatal() {
        let mut transports = mesh(&[addr(1), addr(2)]);
        let mut client = transports.pop().unwrap();
        let mut server = transports.pop().unwrap();

        let params = SessionParams::new(10, 5);
        let hello = InitMessage::new(MessageType::InitHello, 20, 5);
        send_init(&mut client, addr(1), &hello).unwrap();

        let kinds = [PlayerKind::Human; 2];
        let err = server_setup(&mut server, &params, 2, &kinds).unwrap_err();
        assert!(matches!(err, NetError::LagMismatch { got: 20, want: 10 }));
    }

    #[test]
    fn not_enough_human_slots() {
        let mut transports = mesh(&[addr(1), addr(2)]);
        let mut client = transports.pop().unwrap();
        let mut server = transports.pop().unwrap();

        let params = SessionParams::default();
        let hello = InitMessage::new(MessageType::InitHello, params.lag, params.updates);
        send_init(&mut client, addr(1), &hello).unwrap();

        let kinds = [PlayerKind::Human, PlayerKind::Computer, PlayerKind::Nobody];
        let err = server_setup(&mut server, &params, 2, &kinds).unwrap_err();
        assert!(matches!(err, NetError::NotEnoughSlots { wanted: 2 }));
    }

    #[test]
    fn unresolvable_host() {
        let mut transports = mesh(&[addr(1)]);
        let mut client = transports.pop().unwrap();
        let err = client_setup(&mut client, &SessionParams::default(), "no-such-host").unwrap_err();
        assert!(matches!(err, NetError::UnresolvableHost(name) if name == "no-such-host"));
    }
}
