pub mod health;
pub mod metrics;
pub mod orders;
pub mod sagas;
pub mod statistics;
