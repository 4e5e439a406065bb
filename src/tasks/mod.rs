//! Concrete task kinds: device readers and writers, publish/subscribe
//! endpoints, the algorithm controller, and the shutdown monitor.

pub mod controller;
pub mod file_in;
pub mod file_out;
pub mod mcast_pub;
pub mod mcast_sub;
pub mod recorder;
pub mod shutdown;
pub mod tcp_pub;
pub mod tcp_sub;
pub mod tspi;
pub mod udp_in;
pub mod udp_out;
pub mod vme;
