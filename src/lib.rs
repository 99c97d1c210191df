//! recsync - synchronized multi-source recording sessions.
//!
//! Starts screen, audio and camera capture together, splits a session into
//! parts across pause and resume, and merges the parts when it stops. All
//! session state lives in a directory of small records, so each command line
//! invocation picks up where the previous one left off.

pub mod capture;
pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod merge;
pub mod metadata;
pub mod recorder;
pub mod store;
pub mod utils;
