//! Infrastructure layer: queue substrate, image persistence, Redis, and the
//! staging job pipeline.

pub mod event_bus;
pub mod images;
pub mod jobs;
pub mod queue;

#[cfg(test)]
mod integration_tests;
