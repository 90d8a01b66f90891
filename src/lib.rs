//! Promote changes into GitOps repositories by driving git working trees,
//! either by pushing straight to an environment branch or through a pull
//! request that is tracked across runs.

pub mod clients;
pub mod git;
pub mod pr;
pub mod promotion;

mod app;
pub mod commands;
pub mod config;

pub use app::App;
pub use config::Config;

#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    // Plain output for snapshot assertions
    colored::control::set_override(false);
}
