//! `panel-forecast` library crate.
//!
//! The binary (`forecast`) is a thin wrapper around this library so that:
//!
//! - the evaluation core is testable without spawning processes
//! - the pipeline can be driven from other front-ends (launchers, notebooks)

pub mod adapter;
pub mod app;
pub mod cli;
pub mod config;
pub mod cv;
pub mod domain;
pub mod error;
pub mod foundation;
pub mod hardware;
pub mod io;
pub mod math;
pub mod metrics;
pub mod models;
pub mod neural;
pub mod planner;
pub mod preprocess;
pub mod registry;
pub mod report;
