// warcry-common — lockstep network synchronization core
//
// Every peer runs an identical deterministic simulation; this crate makes
// sure all of them execute the same player commands on the same frames.
// Commands are delayed by a fixed lag, duplicated across packets against
// loss, and re-requested when a peer stalls. No game state ever crosses
// the wire.
//
// The platform layer (warcry-sys) supplies the UDP transport; the
// simulation supplies the CommandSink.

pub mod cmd_log;
pub mod engine;
pub mod error;
pub mod game_api;
pub mod handshake;
pub mod net;
pub mod net_queue;
pub mod proto;
pub mod queue;
mod send;
