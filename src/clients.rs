//! Integration layers for the external programs and services promotions drive.
//!
//! - [`process`]: runs external programs with an explicit argument vector,
//!   working directory and environment
//! - [`github`]: pull request management for review-gated promotions
//! - [`github_curl`]: curl-based HTTP client for making GitHub API requests
//!
//! Each layer sits behind a trait so unit tests can substitute a mock.

pub mod github;
pub mod github_curl;
pub mod process;
