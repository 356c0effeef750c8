//! The tally agent: runs the collectors, keeps the latest snapshot and
//! pushes it to the server through every enabled transport.

pub mod config;
pub mod delivery;
pub mod transport;
