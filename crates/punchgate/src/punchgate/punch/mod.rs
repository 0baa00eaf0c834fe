//! NAT hole punching between this node and each online peer.

pub mod attempt;
pub mod datagram;
pub mod puncher;
