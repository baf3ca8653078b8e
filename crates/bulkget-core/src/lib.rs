pub mod config;
pub mod logging;

pub mod barrier;
pub mod batch;
pub mod control;
pub mod destination;
pub mod failure;
pub mod fetcher;
pub mod pool;
pub mod queue;
pub mod report;
pub mod resource;
