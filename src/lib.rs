pub mod constants;
pub mod error;
pub mod geometry;
pub mod report;
pub mod rollover;
pub mod clocktrack;
pub mod quorum;
pub mod solver;
pub mod net;
pub mod coordinator;
pub mod output;
pub mod config;
