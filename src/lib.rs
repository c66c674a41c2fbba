//! craft-code library crate
//!
//! The agent core (sandbox, tools, approval, dispatch, conversation loop)
//! lives here so benchmarks and tests can drive it without the terminal.

pub mod approval;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod dispatch;
pub mod format;
pub mod llm;
pub mod sandbox;
pub mod session;
pub mod setup;
pub mod tools;
pub mod util;
