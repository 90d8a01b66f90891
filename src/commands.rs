//! Command implementations behind the `gitpromote` binary.
//!
//! Each command clones what it needs into a private home directory, does its
//! work, writes a human-readable report to the given writer and removes the
//! clone again.

pub mod commits;
pub mod promote;
pub mod tags;
