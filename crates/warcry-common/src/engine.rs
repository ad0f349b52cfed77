// engine.rs — the lockstep frame scheduler and sync state machine
//
// Single-threaded and frame-driven. Each simulation tick the host calls, in
// order: drain_network, on_tick (which ends with sync_check), and recover
// once per video interrupt while out of sync. The engine owns every piece
// of mutable network state; the simulation is reached only through the
// CommandSink and the wire only through the DatagramTransport.

use log::{debug, info, warn};

use crate::cmd_log::CommandLog;
use crate::game_api::CommandSink;
use crate::handshake::{Roster, SessionParams};
use crate::net::{DatagramTransport, PollStatus};
use crate::proto::{
    decode_packet, encode_packet, CommandMessage, MessageType, NetMessage, Packet, DEST_NONE, DUPS,
    MAX_PLAYERS, PACKET_WIRE_SIZE,
};
use crate::queue::{reconstruct_frame, CommandQueues};

/// Lifecycle after the roster is sealed. The handshake phase lives in
/// `handshake`; constructing an engine is the transition into `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Terminated,
}

pub struct LockstepEngine {
    transport: Option<Box<dyn DatagramTransport>>,
    roster: Roster,
    lag: u32,
    updates: u32,
    pub(crate) queues: CommandQueues,
    pub(crate) cmd_log: Box<dyn CommandLog>,
    state: SessionState,
    in_sync: bool,
    /// The commit frame we are stalled on, meaningful while out of sync.
    waiting_frame: u32,
    /// Resend throttle, compared against the video interrupt counter.
    recover_delay: u32,
    /// Guards against double-scheduling when a stalled commit is retried.
    last_send_frame: Option<u32>,
    /// Guards against re-executing a frame the host retries while stalled.
    last_commit_frame: Option<u32>,
}

impl LockstepEngine {
    /// Engine for a solo game: no transport, commands dispatch directly.
    pub fn offline(cmd_log: Box<dyn CommandLog>) -> Self {
        let params = SessionParams::default();
        Self::build(None, Roster::solo(0), &params, cmd_log)
    }

    /// Engine for a network game with a sealed roster. Seeds the inbox so
    /// the first `lag` frames can commit before any datagram arrives.
    pub fn networked(
        transport: Box<dyn DatagramTransport>,
        roster: Roster,
        params: &SessionParams,
        cmd_log: Box<dyn CommandLog>,
    ) -> Self {
        Self::build(Some(transport), roster, params, cmd_log)
    }

    fn build(
        transport: Option<Box<dyn DatagramTransport>>,
        roster: Roster,
        params: &SessionParams,
        cmd_log: Box<dyn CommandLog>,
    ) -> Self {
        let mut queues = CommandQueues::new();
        if transport.is_some() {
            queues.seed_initial(params.lag, params.updates, &roster.remote_players());
        }
        Self {
            transport,
            roster,
            lag: params.lag,
            updates: params.updates,
            queues,
            cmd_log,
            state: SessionState::Running,
            in_sync: true,
            waiting_frame: 0,
            recover_delay: params.updates,
            last_send_frame: None,
            last_commit_frame: None,
        }
    }

    pub fn is_networked(&self) -> bool {
        self.transport.is_some()
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    // ============================================================
    // Inbound path
    // ============================================================

    /// Drain every waiting datagram into the inbox. Never blocks; called
    /// every frame while the simulation runs.
    pub fn drain_network(&mut self, sink: &mut dyn CommandSink) {
        if self.state != SessionState::Running {
            return;
        }
        loop {
            let packet = {
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                match transport.poll_ready(0) {
                    Ok(PollStatus::Ready) => {}
                    Ok(PollStatus::Idle) => break,
                    Err(err) => {
                        warn!("poll failed: {err}");
                        break;
                    }
                }
                let mut buf = [0u8; PACKET_WIRE_SIZE];
                let (len, from) = match transport.recv_from(&mut buf) {
                    Ok(got) => got,
                    Err(err) => {
                        warn!("receive failed: {err}");
                        break;
                    }
                };
                match decode_packet(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        debug!("dropping datagram from {from}: {err}");
                        continue;
                    }
                }
            };
            self.dispatch_packet(&packet, sink);
            if self.state == SessionState::Terminated {
                return;
            }
        }
        self.recheck_sync();
    }

    fn dispatch_packet(&mut self, packet: &Packet, sink: &mut dyn CommandSink) {
        // late setup residue arrives as a full InitMessage whose type byte
        // lands in the first slot; never parse it as commands
        if packet.slots[0].msg_type().is_some_and(|t| t.is_init()) {
            debug!("ignoring late setup datagram");
            return;
        }

        let current = sink.current_frame();
        for slot in &packet.slots {
            let Some(tag) = slot.msg_type() else {
                continue;
            };
            match slot {
                NetMessage::Chat(chat) => {
                    if (chat.player as usize) < MAX_PLAYERS {
                        let time = reconstruct_frame(current, chat.frame_lo);
                        self.queues.inbox_put(time, chat.player, *slot);
                    }
                }
                NetMessage::Command(cmd) => match tag {
                    MessageType::Quit => {
                        info!("got quit from the network");
                        sink.quit();
                        self.state = SessionState::Terminated;
                        self.shutdown();
                        return;
                    }
                    MessageType::Resend => {
                        let time = reconstruct_frame(current, cmd.frame_lo);
                        match self.queues.find_output(time) {
                            Some(idx) => {
                                debug!("resend request for frame {time}");
                                self.send_packet_from(idx);
                            }
                            None => debug!("no retained command for resend of frame {time}"),
                        }
                    }
                    MessageType::Sync => {
                        if (cmd.x as usize) < MAX_PLAYERS {
                            let time = reconstruct_frame(current, cmd.frame_lo);
                            self.queues.inbox_put(time, cmd.x as u8, *slot);
                        }
                    }
                    MessageType::InitHello | MessageType::InitReply | MessageType::InitConfig => {}
                    _ => {
                        // a unit command; the sender is the unit's owner
                        let Some(unit) = sink.unit(cmd.unit) else {
                            debug!("command {tag:?} for unknown unit {} dropped", cmd.unit);
                            continue;
                        };
                        let time = reconstruct_frame(current, cmd.frame_lo);
                        self.queues.inbox_put(time, unit.player, *slot);
                    }
                },
            }
        }
    }

    /// While stalled, see whether the drain just delivered what we wait on.
    fn recheck_sync(&mut self) {
        if self.in_sync || self.state != SessionState::Running {
            return;
        }
        let waiting = self.waiting_frame;
        let complete = self
            .roster
            .remotes()
            .all(|e| self.queues.inbox_filled(waiting, e.player));
        if complete {
            debug!("frame {waiting} complete, back in sync");
            self.in_sync = true;
        }
    }

    // ============================================================
    // Commit path
    // ============================================================

    /// The main cadence: schedule and transmit the next local command, then
    /// commit the current frame if every remote command is in. No-op off
    /// the `updates` cadence.
    pub fn on_tick(&mut self, sink: &mut dyn CommandSink) {
        if self.transport.is_none() || self.state != SessionState::Running {
            return;
        }
        // while stalled there is nothing to do here; drain_network flips us
        // back once the missing commands arrive
        if !self.in_sync {
            return;
        }
        let frame = sink.current_frame();
        if frame % self.updates != 0 {
            return;
        }

        // once per commit frame, even when the commit below stalls and the
        // host retries
        if self.last_send_frame != Some(frame) {
            self.last_send_frame = Some(frame);
            let target = self.queues.schedule_next(frame, self.lag, sink.this_player());
            debug!("frame {frame}: local command scheduled for {target}");
            self.send_packet_from(0);
        }

        if !self.commit_ready(frame) {
            debug!("frame {frame} cannot commit yet");
            self.stall(frame);
            return;
        }

        if self.last_commit_frame != Some(frame) {
            self.last_commit_frame = Some(frame);
            self.exec_frame(frame, sink);
        }
        self.sync_check(sink);
    }

    /// Every remote player's command for `frame` must be in the inbox
    /// before anything executes; a partial commit could never be retried.
    fn commit_ready(&self, frame: u32) -> bool {
        self.roster
            .remotes()
            .all(|e| self.queues.inbox_filled(frame, e.player))
    }

    /// Execute the frame in canonical player order, independent of
    /// datagram arrival order.
    fn exec_frame(&mut self, frame: u32, sink: &mut dyn CommandSink) {
        let this_player = sink.this_player();
        for player in 0..sink.num_players() {
            if player == this_player {
                self.queues.drop_stale(frame, self.lag);
                if let Some(msg) = self.queues.local_command_for(frame).copied() {
                    parse_and_apply(&msg, sink);
                }
            } else if self.roster.is_remote_player(player) {
                let msg = self.queues.inbox_slot(frame, player).data;
                parse_and_apply(&msg, sink);
            }
            // remaining players are computer-controlled; they issue no
            // network commands
        }
    }

    /// Is everything in for the next commit frame? Run at the end of every
    /// commit; arms the recover path when a command is missing.
    pub fn sync_check(&mut self, sink: &mut dyn CommandSink) {
        if self.transport.is_none() || self.state != SessionState::Running {
            return;
        }
        let next = sink.current_frame() + self.updates;
        self.in_sync = true;
        let missing = self
            .roster
            .remotes()
            .any(|e| !self.queues.inbox_filled(next, e.player));
        if missing {
            self.stall(next);
        }
    }

    fn stall(&mut self, frame: u32) {
        self.in_sync = false;
        self.waiting_frame = frame;
        self.recover_delay = self.updates;
    }

    // ============================================================
    // Recovery
    // ============================================================

    /// Called once per video interrupt while out of sync. Asks every peer
    /// to re-deliver its command for the frame we are stalled on, throttled
    /// so a slow peer is not flooded.
    pub fn recover(&mut self, video_interrupts: u32) {
        if self.in_sync || self.transport.is_none() || self.state != SessionState::Running {
            return;
        }
        if self.recover_delay < video_interrupts {
            self.recover_delay += self.updates;
            self.send_resend_request();
        }
    }

    fn send_resend_request(&mut self) {
        // the request rides with our newest commands so the stalled peer
        // also catches up on anything it lost from us
        let Some(history) = self.queues.packet_slots(0) else {
            return;
        };
        let mut request = CommandMessage::with_tag(MessageType::Resend);
        request.frame_lo = (self.waiting_frame & 0xFF) as u8;

        let mut slots = [NetMessage::Command(request); DUPS];
        slots[1..].copy_from_slice(&history[..DUPS - 1]);
        debug!("requesting resend of frame {}", self.waiting_frame);
        self.broadcast_packet(&Packet { slots });
    }

    // ============================================================
    // Outbound path
    // ============================================================

    /// Broadcast a packet seeded at output entry `start` (0 = newest) with
    /// the next older commands as redundancy.
    fn send_packet_from(&mut self, start: usize) {
        let Some(slots) = self.queues.packet_slots(start) else {
            return;
        };
        self.broadcast_packet(&Packet { slots });
    }

    fn broadcast_packet(&mut self, packet: &Packet) {
        let mut buf = [0u8; PACKET_WIRE_SIZE];
        encode_packet(packet, &mut buf);
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        for entry in self.roster.entries().iter().filter(|e| !e.addr.is_unset()) {
            if let Err(err) = transport.send_to(entry.addr, &buf) {
                warn!("send to {} failed: {err}", entry.addr);
            }
        }
    }

    // ============================================================
    // Termination
    // ============================================================

    /// Leave the game: tell every peer once, best effort, and release the
    /// socket. There is no acknowledgement; packet redundancy has to cover
    /// a lost quit.
    pub fn quit(&mut self, sink: &mut dyn CommandSink) {
        if self.transport.is_some() && self.state == SessionState::Running {
            let mut msg = CommandMessage::with_tag(MessageType::Quit);
            msg.frame_lo = (sink.current_frame() & 0xFF) as u8;
            let mut slots = [NetMessage::Command(msg); DUPS];
            if let Some(history) = self.queues.packet_slots(0) {
                slots[1..].copy_from_slice(&history[..DUPS - 1]);
            }
            self.broadcast_packet(&Packet { slots });
        }
        self.state = SessionState::Terminated;
        self.shutdown();
    }

    /// Release the transport. Idempotent; runs on every exit path.
    pub fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

// ============================================================
// Command execution
// ============================================================

/// Translate one committed message into a simulation call. Control
/// messages are inert here; a destroyed or unknown unit skips the action.
fn parse_and_apply(msg: &NetMessage, sink: &mut dyn CommandSink) {
    use MessageType::*;

    match msg {
        NetMessage::Chat(chat) => {
            let text = String::from_utf8_lossy(chat.text_bytes()).into_owned();
            if chat.opcode == ChatCont as u8 {
                sink.chat_continue(&text);
            } else {
                sink.chat_begin(&text);
            }
        }
        NetMessage::Command(cmd) => {
            let Some(tag) = cmd.msg_type() else { return };
            if !tag.is_unit_command() {
                return;
            }
            let Some(unit_ref) = sink.unit(cmd.unit) else {
                debug!("command {tag:?} for unknown unit {} skipped", cmd.unit);
                return;
            };
            if unit_ref.destroyed {
                debug!("destroyed unit {} skipped", cmd.unit);
                return;
            }
            // a destroyed destination unit is the simulation's problem
            let flush = cmd.flush();
            let (unit, x, y) = (cmd.unit, cmd.x, cmd.y);
            let dest_opt = (cmd.dest != DEST_NONE).then_some(cmd.dest);
            match tag {
                CommandStop => sink.stop(unit),
                CommandStand => sink.stand_ground(unit, flush),
                CommandFollow => sink.follow(unit, cmd.dest, flush),
                CommandMove => sink.move_to(unit, x, y, flush),
                CommandRepair => sink.repair(unit, x, y, cmd.dest, flush),
                CommandAttack => sink.attack(unit, x, y, dest_opt, flush),
                CommandGround => sink.attack_ground(unit, x, y, flush),
                CommandPatrol => sink.patrol(unit, x, y, flush),
                CommandBoard => sink.board(unit, cmd.dest, flush),
                CommandUnload => sink.unload(unit, x, y, dest_opt, flush),
                CommandBuild => sink.build(unit, x, y, cmd.dest, flush),
                CommandCancelBuild => sink.cancel_build(unit, dest_opt),
                CommandHarvest => sink.harvest(unit, x, y, flush),
                CommandMine => sink.mine(unit, cmd.dest, flush),
                CommandHaul => sink.haul(unit, cmd.dest, flush),
                CommandReturn => sink.return_goods(unit, flush),
                CommandTrain => sink.train(unit, cmd.dest, flush),
                CommandCancelTrain => sink.cancel_train(unit, 0),
                CommandUpgrade => sink.upgrade_to(unit, cmd.dest, flush),
                CommandCancelUpgrade => sink.cancel_upgrade(unit),
                CommandResearch => sink.research(unit, x, flush),
                CommandCancelResearch => sink.cancel_research(unit),
                CommandDemolish => sink.demolish(unit, x, y, dest_opt, flush),
                _ => {}
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================
