pub mod admission;
pub mod app;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod metrics;
