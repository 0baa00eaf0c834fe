//! Hangout (rendezvous server) signalling.

pub mod client;
pub mod protocol;
