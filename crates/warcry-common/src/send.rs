// send.rs — command entry points for the local player
//
// One entry per command kind. Each logs the command, then either calls the
// simulation directly (solo game) or queues a wire message for the next
// commit frame. Either way the simulation sees the same dispatch, so a
// solo game and a network game behave identically.

use crate::cmd_log::{CommandRecord, LogPosition};
use crate::engine::LockstepEngine;
use crate::game_api::{CommandSink, Dest};
use crate::proto::{ChatMessage, CommandMessage, MessageType, NetMessage, CHAT_TEXT_SIZE, FLUSH_BIT};

impl LockstepEngine {
    fn log_command(
        &self,
        sink: &dyn CommandSink,
        name: &str,
        unit: u16,
        flush: bool,
        position: LogPosition,
        dest: Option<u16>,
        extra: Option<u16>,
    ) {
        self.cmd_log.log(&CommandRecord {
            frame: sink.current_frame(),
            unit,
            name,
            flush,
            position,
            dest,
            extra,
        });
    }

    fn queue_command(
        &mut self,
        tag: MessageType,
        unit: u16,
        x: u16,
        y: u16,
        dest: Dest,
        flush: bool,
    ) {
        let mut msg = CommandMessage::with_tag(tag);
        if flush {
            msg.opcode |= FLUSH_BIT;
        }
        msg.unit = unit;
        msg.x = x;
        msg.y = y;
        msg.dest = dest.to_wire();
        self.queues.enqueue_input(NetMessage::Command(msg));
    }

    pub fn send_stop(&mut self, sink: &mut dyn CommandSink, unit: u16) {
        self.log_command(sink, "stop", unit, true, LogPosition::None, None, None);
        if !self.is_networked() {
            sink.stop(unit);
        } else {
            self.queue_command(MessageType::CommandStop, unit, 0, 0, Dest::None, true);
        }
    }

    pub fn send_stand_ground(&mut self, sink: &mut dyn CommandSink, unit: u16, flush: bool) {
        self.log_command(sink, "stand-ground", unit, flush, LogPosition::None, None, None);
        if !self.is_networked() {
            sink.stand_ground(unit, flush);
        } else {
            self.queue_command(MessageType::CommandStand, unit, 0, 0, Dest::None, flush);
        }
    }

    pub fn send_follow(&mut self, sink: &mut dyn CommandSink, unit: u16, dest: u16, flush: bool) {
        self.log_command(sink, "follow", unit, flush, LogPosition::None, Some(dest), None);
        if !self.is_networked() {
            sink.follow(unit, dest, flush);
        } else {
            self.queue_command(MessageType::CommandFollow, unit, 0, 0, Dest::Unit(dest), flush);
        }
    }

    pub fn send_move(&mut self, sink: &mut dyn CommandSink, unit: u16, x: u16, y: u16, flush: bool) {
        self.log_command(sink, "move", unit, flush, LogPosition::Location(x, y), None, None);
        if !self.is_networked() {
            sink.move_to(unit, x, y, flush);
        } else {
            self.queue_command(MessageType::CommandMove, unit, x, y, Dest::None, flush);
        }
    }

    pub fn send_repair(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        dest: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "repair",
            unit,
            flush,
            LogPosition::Location(x, y),
            Some(dest),
            None,
        );
        if !self.is_networked() {
            sink.repair(unit, x, y, dest, flush);
        } else {
            self.queue_command(MessageType::CommandRepair, unit, x, y, Dest::Unit(dest), flush);
        }
    }

    pub fn send_attack(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        dest: Option<u16>,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "attack",
            unit,
            flush,
            LogPosition::Location(x, y),
            dest,
            None,
        );
        let wire_dest = dest.map_or(Dest::None, Dest::Unit);
        if !self.is_networked() {
            sink.attack(unit, x, y, dest, flush);
        } else {
            self.queue_command(MessageType::CommandAttack, unit, x, y, wire_dest, flush);
        }
    }

    pub fn send_attack_ground(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "attack-ground",
            unit,
            flush,
            LogPosition::Location(x, y),
            None,
            None,
        );
        if !self.is_networked() {
            sink.attack_ground(unit, x, y, flush);
        } else {
            self.queue_command(MessageType::CommandGround, unit, x, y, Dest::None, flush);
        }
    }

    pub fn send_patrol(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "patrol",
            unit,
            flush,
            LogPosition::Location(x, y),
            None,
            None,
        );
        if !self.is_networked() {
            sink.patrol(unit, x, y, flush);
        } else {
            self.queue_command(MessageType::CommandPatrol, unit, x, y, Dest::None, flush);
        }
    }

    pub fn send_board(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        dest: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "board",
            unit,
            flush,
            LogPosition::Location(x, y),
            Some(dest),
            None,
        );
        if !self.is_networked() {
            sink.board(unit, dest, flush);
        } else {
            self.queue_command(MessageType::CommandBoard, unit, x, y, Dest::Unit(dest), flush);
        }
    }

    pub fn send_unload(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        what: Option<u16>,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "unload",
            unit,
            flush,
            LogPosition::Location(x, y),
            what,
            None,
        );
        let wire_dest = what.map_or(Dest::None, Dest::Unit);
        if !self.is_networked() {
            sink.unload(unit, x, y, what, flush);
        } else {
            self.queue_command(MessageType::CommandUnload, unit, x, y, wire_dest, flush);
        }
    }

    pub fn send_build(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        unit_type: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "build",
            unit,
            flush,
            LogPosition::Location(x, y),
            None,
            Some(unit_type),
        );
        if !self.is_networked() {
            sink.build(unit, x, y, unit_type, flush);
        } else {
            self.queue_command(
                MessageType::CommandBuild,
                unit,
                x,
                y,
                Dest::UnitType(unit_type),
                flush,
            );
        }
    }

    pub fn send_cancel_build(&mut self, sink: &mut dyn CommandSink, unit: u16, worker: u16) {
        // the worker field is carried even while unit and worker are the
        // same building; the simulation may split them later
        self.log_command(
            sink,
            "cancel-build",
            unit,
            true,
            LogPosition::None,
            Some(worker),
            None,
        );
        if !self.is_networked() {
            sink.cancel_build(unit, Some(worker));
        } else {
            self.queue_command(
                MessageType::CommandCancelBuild,
                unit,
                0,
                0,
                Dest::Unit(worker),
                true,
            );
        }
    }

    pub fn send_harvest(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "harvest",
            unit,
            flush,
            LogPosition::Location(x, y),
            None,
            None,
        );
        if !self.is_networked() {
            sink.harvest(unit, x, y, flush);
        } else {
            self.queue_command(MessageType::CommandHarvest, unit, x, y, Dest::None, flush);
        }
    }

    pub fn send_mine(&mut self, sink: &mut dyn CommandSink, unit: u16, dest: u16, flush: bool) {
        self.log_command(sink, "mine", unit, flush, LogPosition::None, Some(dest), None);
        if !self.is_networked() {
            sink.mine(unit, dest, flush);
        } else {
            self.queue_command(MessageType::CommandMine, unit, 0, 0, Dest::Unit(dest), flush);
        }
    }

    pub fn send_haul(&mut self, sink: &mut dyn CommandSink, unit: u16, dest: u16, flush: bool) {
        self.log_command(sink, "haul", unit, flush, LogPosition::None, Some(dest), None);
        if !self.is_networked() {
            sink.haul(unit, dest, flush);
        } else {
            self.queue_command(MessageType::CommandHaul, unit, 0, 0, Dest::Unit(dest), flush);
        }
    }

    pub fn send_return_goods(&mut self, sink: &mut dyn CommandSink, unit: u16, flush: bool) {
        self.log_command(sink, "return", unit, flush, LogPosition::None, None, None);
        if !self.is_networked() {
            sink.return_goods(unit, flush);
        } else {
            self.queue_command(MessageType::CommandReturn, unit, 0, 0, Dest::None, flush);
        }
    }

    pub fn send_train(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        unit_type: u16,
        flush: bool,
    ) {
        self.log_command(sink, "train", unit, flush, LogPosition::None, None, Some(unit_type));
        if !self.is_networked() {
            sink.train(unit, unit_type, flush);
        } else {
            self.queue_command(
                MessageType::CommandTrain,
                unit,
                0,
                0,
                Dest::UnitType(unit_type),
                flush,
            );
        }
    }

    pub fn send_cancel_train(&mut self, sink: &mut dyn CommandSink, unit: u16, slot: u16) {
        self.log_command(
            sink,
            "cancel-train",
            unit,
            true,
            LogPosition::Value(slot),
            None,
            None,
        );
        if !self.is_networked() {
            sink.cancel_train(unit, slot);
        } else {
            // the slot rides in x; receivers currently cancel slot 0
            self.queue_command(MessageType::CommandCancelTrain, unit, slot, 0, Dest::None, true);
        }
    }

    pub fn send_upgrade_to(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        unit_type: u16,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "upgrade-to",
            unit,
            flush,
            LogPosition::None,
            None,
            Some(unit_type),
        );
        if !self.is_networked() {
            sink.upgrade_to(unit, unit_type, flush);
        } else {
            self.queue_command(
                MessageType::CommandUpgrade,
                unit,
                0,
                0,
                Dest::UnitType(unit_type),
                flush,
            );
        }
    }

    pub fn send_cancel_upgrade(&mut self, sink: &mut dyn CommandSink, unit: u16) {
        self.log_command(
            sink,
            "cancel-upgrade-to",
            unit,
            true,
            LogPosition::None,
            None,
            None,
        );
        if !self.is_networked() {
            sink.cancel_upgrade(unit);
        } else {
            self.queue_command(MessageType::CommandCancelUpgrade, unit, 0, 0, Dest::None, true);
        }
    }

    pub fn send_research(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        upgrade: u16,
        flush: bool,
    ) {
        self.log_command(sink, "research", unit, flush, LogPosition::None, None, Some(upgrade));
        if !self.is_networked() {
            sink.research(unit, upgrade, flush);
        } else {
            // the upgrade index rides in x; dest stays free
            self.queue_command(
                MessageType::CommandResearch,
                unit,
                upgrade,
                0,
                Dest::None,
                flush,
            );
        }
    }

    pub fn send_cancel_research(&mut self, sink: &mut dyn CommandSink, unit: u16) {
        self.log_command(
            sink,
            "cancel-research",
            unit,
            true,
            LogPosition::None,
            None,
            None,
        );
        if !self.is_networked() {
            sink.cancel_research(unit);
        } else {
            self.queue_command(MessageType::CommandCancelResearch, unit, 0, 0, Dest::None, true);
        }
    }

    pub fn send_demolish(
        &mut self,
        sink: &mut dyn CommandSink,
        unit: u16,
        x: u16,
        y: u16,
        dest: Option<u16>,
        flush: bool,
    ) {
        self.log_command(
            sink,
            "demolish",
            unit,
            flush,
            LogPosition::Location(x, y),
            dest,
            None,
        );
        let wire_dest = dest.map_or(Dest::None, Dest::Unit);
        if !self.is_networked() {
            sink.demolish(unit, x, y, dest, flush);
        } else {
            self.queue_command(MessageType::CommandDemolish, unit, x, y, wire_dest, flush);
        }
    }

    /// Queue a chat line, split into wire-sized fragments. Sent with low
    /// priority behind any pending commands; each fragment takes one commit
    /// frame. Chat in a solo game has nobody to reach and is dropped.
    pub fn send_chat(&mut self, sink: &mut dyn CommandSink, text: &str) {
        if !self.is_networked() {
            return;
        }
        let player = sink.this_player();
        let mut rest = text.as_bytes();
        let mut tag = MessageType::Chat;
        while rest.len() >= CHAT_TEXT_SIZE {
            let (chunk, tail) = rest.split_at(CHAT_TEXT_SIZE);
            self.queues
                .enqueue_input(NetMessage::Chat(ChatMessage::new(tag, player, chunk)));
            tag = MessageType::ChatCont;
            rest = tail;
        }
        self.queues
            .enqueue_input(NetMessage::Chat(ChatMessage::new(tag, player, rest)));
    }
}
