// warcry-sys — OS integration for the lockstep core
//
// Owns the real UDP socket and the background receive thread; everything
// above this crate talks to the network through the DatagramTransport port.

pub mod net_common;
pub mod net_io_thread;
pub mod net_udp;
