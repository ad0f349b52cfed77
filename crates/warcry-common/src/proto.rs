// proto.rs — wire protocol: message types, fixed layouts, encode/decode
//
// Every multi-byte field is big-endian on the wire. Command and chat
// messages share one 12-byte slot; a packet is 4 consecutive slots. The
// codec is pure and allocation-free; callers hand in fixed buffers.

use std::io::Write;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::WireError;
use crate::net::HostAddr;

// ============================================================
// Protocol constants
// ============================================================

/// Network protocol version. Mismatching peers are rejected at setup.
pub const PROTOCOL_VERSION: i32 = 1;

/// Default UDP port; bind falls back to the next port when taken.
pub const DEFAULT_PORT: u16 = 6660;

/// Redundant copies of recent commands carried per packet.
pub const DUPS: usize = 4;

/// Hard cap on session participants.
pub const MAX_PLAYERS: usize = 16;

/// Inbox ring size; one slot per (frame mod window, player).
pub const INBOX_WINDOW: usize = 256;

/// High bit of the opcode byte: replace pending orders instead of appending.
pub const FLUSH_BIT: u8 = 0x80;

/// Wire value of "no destination unit".
pub const DEST_NONE: u16 = 0xFFFF;

pub const COMMAND_WIRE_SIZE: usize = 12;
pub const PACKET_WIRE_SIZE: usize = DUPS * COMMAND_WIRE_SIZE;
pub const CHAT_TEXT_SIZE: usize = 9;
pub const HOST_WIRE_SIZE: usize = 6;

/// type + version + lag + updates + hosts_count + host table + player numbers
pub const INIT_WIRE_SIZE: usize = 1 + 4 + 4 + 4 + 1 + MAX_PLAYERS * HOST_WIRE_SIZE + MAX_PLAYERS;

// ============================================================
// Message types
// ============================================================

/// 7-bit message tag. Unit commands first, then control messages; the high
/// bit of the opcode byte is the flush flag and never part of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    CommandStop = 0,
    CommandStand,
    CommandFollow,
    CommandMove,
    CommandRepair,
    CommandAttack,
    CommandGround,
    CommandPatrol,
    CommandBoard,
    CommandUnload,
    CommandBuild,
    CommandCancelBuild,
    CommandHarvest,
    CommandMine,
    CommandHaul,
    CommandReturn,
    CommandTrain,
    CommandCancelTrain,
    CommandUpgrade,
    CommandCancelUpgrade,
    CommandResearch,
    CommandCancelResearch,
    CommandDemolish,

    /// Heartbeat filler when a peer has no user input for a commit frame.
    Sync,
    /// Leave the game; terminates the session on every receiver.
    Quit,
    /// Request retransmission of a specific target frame's command.
    Resend,

    Chat,
    ChatCont,

    InitHello,
    InitReply,
    InitConfig,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match tag {
            0 => CommandStop,
            1 => CommandStand,
            2 => CommandFollow,
            3 => CommandMove,
            4 => CommandRepair,
            5 => CommandAttack,
            6 => CommandGround,
            7 => CommandPatrol,
            8 => CommandBoard,
            9 => CommandUnload,
            10 => CommandBuild,
            11 => CommandCancelBuild,
            12 => CommandHarvest,
            13 => CommandMine,
            14 => CommandHaul,
            15 => CommandReturn,
            16 => CommandTrain,
            17 => CommandCancelTrain,
            18 => CommandUpgrade,
            19 => CommandCancelUpgrade,
            20 => CommandResearch,
            21 => CommandCancelResearch,
            22 => CommandDemolish,
            23 => Sync,
            24 => Quit,
            25 => Resend,
            26 => Chat,
            27 => ChatCont,
            28 => InitHello,
            29 => InitReply,
            30 => InitConfig,
            _ => return None,
        })
    }

    /// True for the unit command range (everything a player issues to units).
    pub fn is_unit_command(&self) -> bool {
        (*self as u8) <= MessageType::CommandDemolish as u8
    }

    /// True for setup-phase messages that must not appear in command packets.
    pub fn is_init(&self) -> bool {
        matches!(
            self,
            MessageType::InitHello | MessageType::InitReply | MessageType::InitConfig
        )
    }
}

// ============================================================
// Command / chat slots
// ============================================================

/// A unit command as carried in one packet slot.
///
/// `opcode` is `tag | FLUSH_BIT`; `frame_lo` is the low byte of the target
/// execution frame. `dest` is overloaded: a unit slot, a unit-type index
/// (build/train/upgrade), or `DEST_NONE`. `x` doubles as the upgrade index
/// for research and the queue slot for cancel-train.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandMessage {
    pub opcode: u8,
    pub frame_lo: u8,
    pub unit: u16,
    pub x: u16,
    pub y: u16,
    pub dest: u16,
}

impl CommandMessage {
    pub fn with_tag(tag: MessageType) -> Self {
        Self {
            opcode: tag as u8,
            ..Default::default()
        }
    }

    pub fn tag(&self) -> u8 {
        self.opcode & !FLUSH_BIT
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag())
    }

    pub fn flush(&self) -> bool {
        self.opcode & FLUSH_BIT != 0
    }
}

/// A chat fragment, overlaid on the same 12-byte slot as a command.
/// Opcode and frame_lo stay at bytes 0 and 1 so receivers can dispatch
/// without knowing the slot kind up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatMessage {
    pub opcode: u8,
    pub frame_lo: u8,
    pub player: u8,
    pub text: [u8; CHAT_TEXT_SIZE],
}

impl ChatMessage {
    pub fn new(tag: MessageType, player: u8, chunk: &[u8]) -> Self {
        let mut text = [0u8; CHAT_TEXT_SIZE];
        let n = chunk.len().min(CHAT_TEXT_SIZE);
        text[..n].copy_from_slice(&chunk[..n]);
        Self {
            opcode: tag as u8,
            frame_lo: 0,
            player,
            text,
        }
    }

    /// Text bytes with trailing NUL padding removed.
    pub fn text_bytes(&self) -> &[u8] {
        let end = self
            .text
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        &self.text[..end]
    }
}

/// One packet slot: either shape, told apart by the opcode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMessage {
    Command(CommandMessage),
    Chat(ChatMessage),
}

impl NetMessage {
    pub fn sync(player: u8) -> Self {
        let mut msg = CommandMessage::with_tag(MessageType::Sync);
        msg.x = player as u16;
        NetMessage::Command(msg)
    }

    pub fn tag(&self) -> u8 {
        match self {
            NetMessage::Command(c) => c.tag(),
            NetMessage::Chat(c) => c.opcode & !FLUSH_BIT,
        }
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag())
    }

    pub fn frame_lo(&self) -> u8 {
        match self {
            NetMessage::Command(c) => c.frame_lo,
            NetMessage::Chat(c) => c.frame_lo,
        }
    }

    pub fn set_frame_lo(&mut self, lo: u8) {
        match self {
            NetMessage::Command(c) => c.frame_lo = lo,
            NetMessage::Chat(c) => c.frame_lo = lo,
        }
    }
}

impl Default for NetMessage {
    fn default() -> Self {
        NetMessage::Command(CommandMessage::default())
    }
}

/// Exactly `DUPS` slots; always 48 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Packet {
    pub slots: [NetMessage; DUPS],
}

// ============================================================
// Setup message
// ============================================================

/// Session setup message exchanged during peer discovery. Fixed layout;
/// unused host-table entries stay zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMessage {
    pub msg_type: u8,
    pub version: i32,
    pub lag: i32,
    pub updates: i32,
    pub hosts_count: i8,
    pub hosts: [HostAddr; MAX_PLAYERS],
    pub nums: [i8; MAX_PLAYERS],
}

impl InitMessage {
    pub fn new(tag: MessageType, lag: u32, updates: u32) -> Self {
        Self {
            msg_type: tag as u8,
            version: PROTOCOL_VERSION,
            lag: lag as i32,
            updates: updates as i32,
            hosts_count: 0,
            hosts: [HostAddr::UNSET; MAX_PLAYERS],
            nums: [0; MAX_PLAYERS],
        }
    }
}

// ============================================================
// Encode / decode
// ============================================================

fn short(need: usize, got: usize) -> WireError {
    WireError::Short { need, got }
}

fn write_slot(msg: &NetMessage, mut buf: &mut [u8]) {
    // buffer length is checked by the callers; writes cannot fail
    match msg {
        NetMessage::Command(c) => {
            buf.write_u8(c.opcode).unwrap();
            buf.write_u8(c.frame_lo).unwrap();
            buf.write_u16::<BigEndian>(c.unit).unwrap();
            buf.write_u16::<BigEndian>(c.x).unwrap();
            buf.write_u16::<BigEndian>(c.y).unwrap();
            buf.write_u16::<BigEndian>(c.dest).unwrap();
            buf.write_u16::<BigEndian>(0).unwrap(); // pad to slot size
        }
        NetMessage::Chat(c) => {
            buf.write_u8(c.opcode).unwrap();
            buf.write_u8(c.frame_lo).unwrap();
            buf.write_u8(c.player).unwrap();
            buf.write_all(&c.text).unwrap();
        }
    }
}

fn read_slot(buf: &[u8]) -> Result<NetMessage, WireError> {
    let opcode = buf[0];
    let tag = MessageType::from_tag(opcode & !FLUSH_BIT)
        .ok_or(WireError::UnknownOpcode(opcode & !FLUSH_BIT))?;

    if matches!(tag, MessageType::Chat | MessageType::ChatCont) {
        let mut text = [0u8; CHAT_TEXT_SIZE];
        text.copy_from_slice(&buf[3..3 + CHAT_TEXT_SIZE]);
        Ok(NetMessage::Chat(ChatMessage {
            opcode,
            frame_lo: buf[1],
            player: buf[2],
            text,
        }))
    } else {
        let mut r = &buf[2..];
        Ok(NetMessage::Command(CommandMessage {
            opcode,
            frame_lo: buf[1],
            unit: r.read_u16::<BigEndian>().unwrap(),
            x: r.read_u16::<BigEndian>().unwrap(),
            y: r.read_u16::<BigEndian>().unwrap(),
            dest: r.read_u16::<BigEndian>().unwrap(),
        }))
    }
}

pub fn encode_packet(packet: &Packet, buf: &mut [u8; PACKET_WIRE_SIZE]) {
    for (i, slot) in packet.slots.iter().enumerate() {
        write_slot(slot, &mut buf[i * COMMAND_WIRE_SIZE..(i + 1) * COMMAND_WIRE_SIZE]);
    }
}

pub fn decode_packet(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < PACKET_WIRE_SIZE {
        return Err(short(PACKET_WIRE_SIZE, buf.len()));
    }
    let mut packet = Packet::default();
    for (i, slot) in packet.slots.iter_mut().enumerate() {
        *slot = read_slot(&buf[i * COMMAND_WIRE_SIZE..(i + 1) * COMMAND_WIRE_SIZE])?;
    }
    Ok(packet)
}

pub fn encode_init(msg: &InitMessage, buf: &mut [u8; INIT_WIRE_SIZE]) {
    let mut w = &mut buf[..];
    w.write_u8(msg.msg_type).unwrap();
    w.write_i32::<BigEndian>(msg.version).unwrap();
    w.write_i32::<BigEndian>(msg.lag).unwrap();
    w.write_i32::<BigEndian>(msg.updates).unwrap();
    w.write_i8(msg.hosts_count).unwrap();
    for host in &msg.hosts {
        w.write_u32::<BigEndian>(host.host).unwrap();
        w.write_u16::<BigEndian>(host.port).unwrap();
    }
    for num in &msg.nums {
        w.write_i8(*num).unwrap();
    }
}

pub fn decode_init(buf: &[u8]) -> Result<InitMessage, WireError> {
    if buf.len() < INIT_WIRE_SIZE {
        return Err(short(INIT_WIRE_SIZE, buf.len()));
    }
    let mut r = buf;
    let msg_type = r.read_u8().unwrap();
    let version = r.read_i32::<BigEndian>().unwrap();
    let lag = r.read_i32::<BigEndian>().unwrap();
    let updates = r.read_i32::<BigEndian>().unwrap();
    let hosts_count = r.read_i8().unwrap();

    if msg_type == MessageType::InitHello as u8 && version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion { got: version });
    }

    let mut hosts = [HostAddr::UNSET; MAX_PLAYERS];
    for host in hosts.iter_mut() {
        host.host = r.read_u32::<BigEndian>().unwrap();
        host.port = r.read_u16::<BigEndian>().unwrap();
    }
    let mut nums = [0i8; MAX_PLAYERS];
    for num in nums.iter_mut() {
        *num = r.read_i8().unwrap();
    }

    Ok(InitMessage {
        msg_type,
        version,
        lag,
        updates,
        hosts_count,
        hosts,
        nums,
    })
}

// ============================================================
// Tests
// ============================================================
