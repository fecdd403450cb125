pub mod analysis;
pub mod bootstrap;
pub mod cashflow;
pub mod config;
pub mod error;
pub mod regime;
pub mod returns;
pub mod rng;
pub mod simulation;
pub mod types;
