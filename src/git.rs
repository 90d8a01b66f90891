//! Working copies of remote git repositories, driven through the `git` CLI.
//!
//! - [`bare`]: a bare clone owning any number of linked working trees
//! - [`repo`]: a standalone clone with a single working tree
//! - [`worktree`]: content and history operations shared by both shapes
//! - [`auth`]: per-clone credential and identity setup
//!
//! Nothing here caches branch, HEAD or tag state.  Every answer comes from a
//! fresh git invocation against the on-disk repository.

pub mod auth;
pub mod bare;
mod cmd;
pub mod error;
pub mod exit;
pub mod home;
pub mod parse;
pub mod repo;
pub mod worktree;
