//! Core library for the bring-up test execution engine.
//!
//! This library contains the command bus, iteration strategies, single-
//! iteration executor, run orchestrator, status pipeline, and the external
//! step-by-step control API used by GUIs, CLIs, and remote clients driving
//! hardware bring-up experiments.

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod state;
pub mod status;
pub mod strategy;
