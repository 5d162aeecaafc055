#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod commands;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod logging;
pub mod merge;
pub mod progress;
pub mod readiness;
pub mod session;
pub mod state;
pub mod util;
pub mod validate;
pub mod workload;
pub mod workspace;
