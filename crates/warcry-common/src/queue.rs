// queue.rs — command queues feeding the lockstep scheduler
//
// Three structures, all owned by the engine:
//   input  - commands the local player issued this frame, not yet scheduled
//   output - scheduled local commands, newest at the front, kept until
//            stale so they can back the packet redundancy and resends
//   inbox  - fixed ring of remote commands, one slot per (frame, player)

use std::collections::VecDeque;

use crate::proto::{NetMessage, DUPS, INBOX_WINDOW, MAX_PLAYERS};

/// Inbox fill marker for "never written"; the frame counter never gets
/// there in any real session.
const FRAME_NONE: u32 = u32::MAX;

/// A scheduled command: the message plus the absolute frame it executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedCommand {
    pub time: u32,
    pub data: NetMessage,
}

/// One inbox cell. Filled for frame `f` iff `time == f`.
#[derive(Debug, Clone, Copy)]
pub struct InboxSlot {
    pub time: u32,
    pub data: NetMessage,
}

impl InboxSlot {
    const EMPTY: InboxSlot = InboxSlot {
        time: FRAME_NONE,
        data: NetMessage::Command(crate::proto::CommandMessage {
            opcode: 0,
            frame_lo: 0,
            unit: 0,
            x: 0,
            y: 0,
            dest: 0,
        }),
    };
}

pub struct CommandQueues {
    input: VecDeque<NetMessage>,
    output: VecDeque<QueuedCommand>,
    inbox: Vec<[InboxSlot; MAX_PLAYERS]>,
}

impl CommandQueues {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: VecDeque::new(),
            inbox: vec![[InboxSlot::EMPTY; MAX_PLAYERS]; INBOX_WINDOW],
        }
    }

    // ---- input ----

    /// Append a locally issued command; insertion order is preserved.
    pub fn enqueue_input(&mut self, msg: NetMessage) {
        self.input.push_back(msg);
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    // ---- output ----

    /// Move the oldest input (or a synthesized sync heartbeat) to the head
    /// of the output queue, stamped for execution `lag` frames ahead.
    /// Returns the target frame.
    pub fn schedule_next(&mut self, frame: u32, lag: u32, this_player: u8) -> u32 {
        let mut msg = self
            .input
            .pop_front()
            .unwrap_or_else(|| NetMessage::sync(this_player));
        let target = frame + lag;
        msg.set_frame_lo((target & 0xFF) as u8);
        self.output.push_front(QueuedCommand { time: target, data: msg });
        target
    }

    /// Discard entries from the stale end of the output queue. An entry is
    /// kept while `time + lag >= frame`; newer entries cannot be stale
    /// because the queue is time-ordered.
    pub fn drop_stale(&mut self, frame: u32, lag: u32) {
        while let Some(oldest) = self.output.back() {
            if oldest.time + lag >= frame {
                break;
            }
            self.output.pop_back();
        }
    }

    /// Index of the output entry scheduled for `time`, if still retained.
    pub fn find_output(&self, time: u32) -> Option<usize> {
        self.output.iter().position(|q| q.time == time)
    }

    /// The local command executing on `frame`, newest-first scan. At most
    /// one exists since scheduling assigns distinct target frames.
    pub fn local_command_for(&self, frame: u32) -> Option<&NetMessage> {
        self.output
            .iter()
            .find(|q| q.time == frame)
            .map(|q| &q.data)
    }

    /// Fill a packet's slots starting at `start` (0 = newest) and walking
    /// toward older entries, repeating the oldest when the history is
    /// shorter than a packet. `None` when the output queue is empty.
    pub fn packet_slots(&self, start: usize) -> Option<[NetMessage; DUPS]> {
        if self.output.is_empty() || start >= self.output.len() {
            return None;
        }
        let last = self.output.len() - 1;
        let mut slots = [NetMessage::default(); DUPS];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = self.output[(start + i).min(last)].data;
        }
        Some(slots)
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    #[cfg(test)]
    pub fn output_entry(&self, idx: usize) -> &QueuedCommand {
        &self.output[idx]
    }

    // ---- inbox ----

    pub fn inbox_put(&mut self, time: u32, player: u8, msg: NetMessage) {
        let slot = &mut self.inbox[(time as usize) % INBOX_WINDOW][player as usize];
        slot.time = time;
        slot.data = msg;
    }

    pub fn inbox_filled(&self, time: u32, player: u8) -> bool {
        self.inbox[(time as usize) % INBOX_WINDOW][player as usize].time == time
    }

    pub fn inbox_slot(&self, time: u32, player: u8) -> &InboxSlot {
        &self.inbox[(time as usize) % INBOX_WINDOW][player as usize]
    }

    /// Pre-fill the first command window with sync heartbeats so frames up
    /// to and including `lag` can commit before any datagram arrives.
    pub fn seed_initial(&mut self, lag: u32, updates: u32, remote_players: &[u8]) {
        let mut frame = 0;
        while frame <= lag {
            for &player in remote_players {
                let mut msg = NetMessage::sync(player);
                msg.set_frame_lo((frame & 0xFF) as u8);
                self.inbox_put(frame, player, msg);
            }
            frame += updates;
        }
    }
}

impl Default for CommandQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Recover the absolute target frame from its low byte. Valid while the
/// true target lies within 128 frames of `current`, which the lag and
/// cadence bounds guarantee.
pub fn reconstruct_frame(current: u32, frame_lo: u8) -> u32 {
    let n = (current.wrapping_add(128) & !0xFF) | frame_lo as u32;
    if n > current.wrapping_add(128) {
        n.wrapping_sub(256)
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CommandMessage, MessageType};

    fn move_msg(unit: u16) -> NetMessage {
        let mut cmd = CommandMessage::with_tag(MessageType::CommandMove);
        cmd.unit = unit;
        NetMessage::Command(cmd)
    }

    #[test]
    fn schedule_assigns_target_frame() {
        let mut queues = CommandQueues::new();
        queues.enqueue_input(move_msg(7));

        let target = queues.schedule_next(20, 10, 0);
        assert_eq!(target, 30);
        let head = queues.output_entry(0);
        assert_eq!(head.time, 30);
        assert_eq!(head.data.frame_lo(), 30);
        assert_eq!(queues.input_len(), 0);
    }

    #[test]
    fn schedule_synthesizes_sync_when_idle() {
        let mut queues = CommandQueues::new();
        queues.schedule_next(100, 10, 3);

        let head = queues.output_entry(0);
        assert_eq!(head.time, 110);
        match head.data {
            NetMessage::Command(cmd) => {
                assert_eq!(cmd.msg_type(), Some(MessageType::Sync));
                assert_eq!(cmd.x, 3);
                assert_eq!(cmd.frame_lo, 110);
            }
            _ => panic!("expected a command slot"),
        }
    }

    #[test]
    fn input_is_fifo() {
        let mut queues = CommandQueues::new();
        queues.enqueue_input(move_msg(1));
        queues.enqueue_input(move_msg(2));

        queues.schedule_next(0, 10, 0);
        queues.schedule_next(5, 10, 0);

        // oldest input got the earlier target frame
        match queues.output_entry(1).data {
            NetMessage::Command(cmd) => assert_eq!(cmd.unit, 1),
            _ => panic!(),
        }
        match queues.output_entry(0).data {
            NetMessage::Command(cmd) => assert_eq!(cmd.unit, 2),
            _ => panic!(),
        }
    }

    #[test]
    fn drop_stale_keeps_live_entries() {
        let mut queues = CommandQueues::new();
        for frame in [0, 5, 10, 15] {
            queues.schedule_next(frame, 10, 0);
        }
        // targets are 10, 15, 20, 25; with lag 10 nothing is stale at 20
        queues.drop_stale(20, 10);
        assert_eq!(queues.output_len(), 4);

        // at frame 21, target 10 fails 10 + 10 >= 21
        queues.drop_stale(21, 10);
        assert_eq!(queues.output_len(), 3);
        assert_eq!(queues.output_entry(2).time, 15);
    }

    #[test]
    fn packet_slots_walk_newest_to_oldest() {
        let mut queues = CommandQueues::new();
        for (i, frame) in [0u32, 5, 10, 15, 20].iter().enumerate() {
            queues.enqueue_input(move_msg(i as u16));
            queues.schedule_next(*frame, 10, 0);
        }

        let slots = queues.packet_slots(0).unwrap();
        let units: Vec<u16> = slots
            .iter()
            .map(|s| match s {
                NetMessage::Command(cmd) => cmd.unit,
                _ => panic!(),
            })
            .collect();
        assert_eq!(units, vec![4, 3, 2, 1]);
    }

    #[test]
    fn packet_slots_repeat_oldest_when_short() {
        let mut queues = CommandQueues::new();
        queues.enqueue_input(move_msg(1));
        queues.schedule_next(0, 10, 0);
        queues.enqueue_input(move_msg(2));
        queues.schedule_next(5, 10, 0);

        let slots = queues.packet_slots(0).unwrap();
        let units: Vec<u16> = slots
            .iter()
            .map(|s| match s {
                NetMessage::Command(cmd) => cmd.unit,
                _ => panic!(),
            })
            .collect();
        assert_eq!(units, vec![2, 1, 1, 1]);

        assert!(queues.packet_slots(2).is_none());
    }

    #[test]
    fn empty_output_has_no_packet() {
        let queues = CommandQueues::new();
        assert!(queues.packet_slots(0).is_none());
    }

    #[test]
    fn inbox_fill_and_lookup() {
        let mut queues = CommandQueues::new();
        assert!(!queues.inbox_filled(40, 2));

        queues.inbox_put(40, 2, move_msg(9));
        assert!(queues.inbox_filled(40, 2));
        assert!(!queues.inbox_filled(40, 3));

        // same ring slot, different absolute frame
        assert!(!queues.inbox_filled(40 + INBOX_WINDOW as u32, 2));
        queues.inbox_put(40 + INBOX_WINDOW as u32, 2, move_msg(9));
        assert!(queues.inbox_filled(40 + INBOX_WINDOW as u32, 2));
        assert!(!queues.inbox_filled(40, 2));
    }

    #[test]
    fn seeding_covers_the_lag_window() {
        let mut queues = CommandQueues::new();
        queues.seed_initial(10, 5, &[1, 2]);

        for frame in [0, 5, 10] {
            assert!(queues.inbox_filled(frame, 1));
            assert!(queues.inbox_filled(frame, 2));
        }
        assert!(!queues.inbox_filled(15, 1));
        assert!(!queues.inbox_filled(0, 0));
    }

    #[test]
    fn frame_reconstruction_round_trips() {
        for current in [130u32, 200, 255, 256, 1000, 65535, 1_000_000] {
            for target in current - 127..=current + 128 {
                let lo = (target & 0xFF) as u8;
                assert_eq!(
                    reconstruct_frame(current, lo),
                    target,
                    "current={current} target={target}"
                );
            }
        }
    }
}
