//! A small process supervisor.
//!
//! The pieces, leaves first: [`state`] is the per-process lifecycle state
//! machine, [`tree`] owns and restarts a set of named child processes,
//! [`daemon`] exposes one tree over a unix socket speaking the line protocol
//! in [`protocol`], [`client`] talks to that socket, and [`orchestrator`]
//! sequences a declared list of oneshot and longrun services on top of it.

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod state;
pub mod tree;
