//! Simulated hardware for dry runs and tests.

pub mod mock;
