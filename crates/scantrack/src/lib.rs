//! Scantrack: neuroimaging pipeline bookkeeping.
//!
//! Coordinates a processing pipeline around three records of truth: the
//! filesystem of acquired scans, the QC checklist/blacklist metadata
//! store, and the relational dashboard. The library side holds the
//! reusable pieces; the `scantrack` binary wires them to subcommands.

pub mod cli;
pub mod config;
pub mod fsutil;
pub mod metadata;
pub mod proc;
pub mod queue;
pub mod redcap;
