// main.rs — headless lockstep session harness
//
// Drives the whole stack over real UDP against a scripted in-memory
// simulation: handshake, command scheduling, commit, stall recovery, and
// quit. Start one hosting process and connect the others:
//
//   warcry-net --players 2
//   warcry-net --server 127.0.0.1
//
// Every peer prints the commands it commits; in a healthy session the
// printed streams are identical.

use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

use warcry_common::cmd_log::{CommandLog, FileCommandLog, NullCommandLog};
use warcry_common::engine::{LockstepEngine, SessionState};
use warcry_common::error::NetError;
use warcry_common::game_api::{CommandSink, PlayerKind, UnitRef};
use warcry_common::handshake::{client_setup, server_setup, SessionParams};
use warcry_common::proto::DEFAULT_PORT;
use warcry_sys::net_udp::UdpTransport;

#[derive(Parser)]
#[command(name = "warcry-net", about = "headless lockstep session harness")]
struct Args {
    /// Connect to this host[:port] as a client instead of hosting
    #[arg(long)]
    server: Option<String>,

    /// Number of network players when hosting
    #[arg(long, default_value_t = 2)]
    players: u8,

    /// Local UDP port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Frames between issuing a command and executing it
    #[arg(long, default_value_t = 10)]
    lag: u32,

    /// Commit cadence in frames
    #[arg(long, default_value_t = 5)]
    updates: u32,

    /// Simulation frames to run before quitting
    #[arg(long, default_value_t = 200)]
    frames: u32,

    /// Write issued commands to command.log
    #[arg(long)]
    log_commands: bool,
}

/// A stand-in simulation: 32 unit slots owned round-robin by the players,
/// every committed command printed.
struct HeadlessSim {
    frame: u32,
    this_player: u8,
    num_players: u8,
    quit: bool,
}

impl HeadlessSim {
    fn new(this_player: u8, num_players: u8) -> Self {
        Self {
            frame: 0,
            this_player,
            num_players,
            quit: false,
        }
    }

    fn show(&self, what: String) {
        println!("frame {:>4}: {what}", self.frame);
    }
}

impl CommandSink for HeadlessSim {
    fn current_frame(&self) -> u32 {
        self.frame
    }
    fn num_players(&self) -> u8 {
        self.num_players
    }
    fn this_player(&self) -> u8 {
        self.this_player
    }
    fn unit(&self, slot: u16) -> Option<UnitRef> {
        (slot < 32).then(|| UnitRef {
            slot,
            player: (slot % self.num_players as u16) as u8,
            destroyed: false,
        })
    }

    fn stop(&mut self, unit: u16) {
        self.show(format!("unit {unit} stops"));
    }
    fn stand_ground(&mut self, unit: u16, _flush: bool) {
        self.show(format!("unit {unit} stands ground"));
    }
    fn follow(&mut self, unit: u16, dest: u16, _flush: bool) {
        self.show(format!("unit {unit} follows unit {dest}"));
    }
    fn move_to(&mut self, unit: u16, x: u16, y: u16, _flush: bool) {
        self.show(format!("unit {unit} moves to ({x},{y})"));
    }
    fn repair(&mut self, unit: u16, x: u16, y: u16, dest: u16, _flush: bool) {
        self.show(format!("unit {unit} repairs unit {dest} at ({x},{y})"));
    }
    fn attack(&mut self, unit: u16, x: u16, y: u16, dest: Option<u16>, _flush: bool) {
        self.show(format!("unit {unit} attacks {dest:?} at ({x},{y})"));
    }
    fn attack_ground(&mut self, unit: u16, x: u16, y: u16, _flush: bool) {
        self.show(format!("unit {unit} attacks ground ({x},{y})"));
    }
    fn patrol(&mut self, unit: u16, x: u16, y: u16, _flush: bool) {
        self.show(format!("unit {unit} patrols to ({x},{y})"));
    }
    fn board(&mut self, unit: u16, dest: u16, _flush: bool) {
        self.show(format!("unit {unit} boards unit {dest}"));
    }
    fn unload(&mut self, unit: u16, x: u16, y: u16, what: Option<u16>, _flush: bool) {
        self.show(format!("unit {unit} unloads {what:?} at ({x},{y})"));
    }
    fn build(&mut self, unit: u16, x: u16, y: u16, unit_type: u16, _flush: bool) {
        self.show(format!("unit {unit} builds type {unit_type} at ({x},{y})"));
    }
    fn cancel_build(&mut self, unit: u16, _worker: Option<u16>) {
        self.show(format!("unit {unit} cancels construction"));
    }
    fn harvest(&mut self, unit: u16, x: u16, y: u16, _flush: bool) {
        self.show(format!("unit {unit} harvests at ({x},{y})"));
    }
    fn mine(&mut self, unit: u16, dest: u16, _flush: bool) {
        self.show(format!("unit {unit} mines unit {dest}"));
    }
    fn haul(&mut self, unit: u16, dest: u16, _flush: bool) {
        self.show(format!("unit {unit} hauls from unit {dest}"));
    }
    fn return_goods(&mut self, unit: u16, _flush: bool) {
        self.show(format!("unit {unit} returns goods"));
    }
    fn train(&mut self, unit: u16, unit_type: u16, _flush: bool) {
        self.show(format!("unit {unit} trains type {unit_type}"));
    }
    fn cancel_train(&mut self, unit: u16, slot: u16) {
        self.show(format!("unit {unit} cancels training slot {slot}"));
    }
    fn upgrade_to(&mut self, unit: u16, unit_type: u16, _flush: bool) {
        self.show(format!("unit {unit} upgrades to type {unit_type}"));
    }
    fn cancel_upgrade(&mut self, unit: u16) {
        self.show(format!("unit {unit} cancels upgrade"));
    }
    fn research(&mut self, unit: u16, upgrade: u16, _flush: bool) {
        self.show(format!("unit {unit} researches upgrade {upgrade}"));
    }
    fn cancel_research(&mut self, unit: u16) {
        self.show(format!("unit {unit} cancels research"));
    }
    fn demolish(&mut self, unit: u16, x: u16, y: u16, dest: Option<u16>, _flush: bool) {
        self.show(format!("unit {unit} demolishes {dest:?} at ({x},{y})"));
    }

    fn chat_begin(&mut self, text: &str) {
        self.show(format!("chat: {text}"));
    }
    fn chat_continue(&mut self, text: &str) {
        self.show(format!("chat (cont): {text}"));
    }
    fn quit(&mut self) {
        self.show("a peer quit the game".into());
        self.quit = true;
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("warcry-net: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), NetError> {
    let params = SessionParams::new(args.lag, args.updates);
    let cmd_log: Box<dyn CommandLog> = if args.log_commands {
        Box::new(FileCommandLog::new("command.log", "headless demo"))
    } else {
        Box::new(NullCommandLog)
    };

    let networked = args.server.is_some() || args.players > 1;
    if !networked {
        // solo game: commands dispatch straight into the simulation
        let mut engine = LockstepEngine::offline(cmd_log);
        let mut sim = HeadlessSim::new(0, 1);
        engine.send_move(&mut sim, 0, 12, 9, true);
        engine.send_harvest(&mut sim, 0, 12, 10, false);
        engine.send_stop(&mut sim, 0);
        return Ok(());
    }

    let mut transport = UdpTransport::open(args.port)?;
    let roster = match &args.server {
        Some(server_arg) => client_setup(&mut transport, &params, server_arg)?,
        None => {
            let kinds = vec![PlayerKind::Human; args.players as usize];
            server_setup(&mut transport, &params, args.players, &kinds)?
        }
    };
    info!(
        "session up: {} players, we are player {}",
        roster.entries().len(),
        roster.this_player()
    );

    let mut sim = HeadlessSim::new(roster.this_player(), roster.entries().len() as u8);
    let mut engine = LockstepEngine::networked(Box::new(transport), roster, &params, cmd_log);

    let our_unit = sim.this_player as u16;
    let mut interrupts = 0u32;
    while sim.frame < args.frames && !sim.quit && engine.state() == SessionState::Running {
        engine.drain_network(&mut sim);
        engine.on_tick(&mut sim);

        if engine.in_sync() {
            // scripted inputs so the session has something to agree on
            if sim.frame == 30 {
                engine.send_move(&mut sim, our_unit, 40, 40, true);
            }
            if sim.frame == 60 {
                let line = format!("hello from player {}", sim.this_player);
                engine.send_chat(&mut sim, &line);
            }
            sim.frame += 1;
            interrupts = 0;
        } else {
            interrupts += 1;
            engine.recover(interrupts);
        }
        thread::sleep(Duration::from_millis(10));
    }

    engine.quit(&mut sim);
    info!("session over at frame {}", sim.frame);
    Ok(())
}
