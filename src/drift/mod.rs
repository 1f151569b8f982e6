//! Drift detection: change-set model and codec, on-disk store, schedule
//! queue, detector workers, and the coordinator that ships results.

pub mod bundle;
pub mod changeset;
pub mod codec;
pub mod coordinator;
pub mod definition;
pub mod detector;
pub mod manager;
pub mod queue;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_properties;
