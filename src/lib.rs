pub mod agent;
pub mod canonical;
pub mod commands;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod git;
pub mod keystore;
pub mod meshpack;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod store;
pub mod watchdog;
pub mod weave;
pub mod witness;
