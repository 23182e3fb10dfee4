//! Blockchain core library.
//!
//! Maintains a fork-aware tree of cryptographically linked blocks, selects a
//! canonical chain among competing forks, executes transactions against a
//! world state with gas accounting, and dispatches typed network messages to
//! subscribers.

pub mod core;
pub mod crypto;
pub mod net;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod test_utils;
