//! Multicore Test Suite
//!
//! End-to-end tests that drive `multicore-runtime` the way an embedder does:
//! load a guest from disk, preload the pool and run the entry point.

pub mod tests;

pub use tests::TestConfig;
