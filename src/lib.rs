pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod location;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod stats;
pub mod storage;
pub mod util;
