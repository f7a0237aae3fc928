pub mod isolation_forest;
pub mod kalman;
pub mod ks;
pub mod psi;
pub mod ring;

// Re-exports for convenience
pub use isolation_forest::IsolationForest;
pub use kalman::ScalarKalman;
pub use ks::ks_two_sample;
pub use psi::population_stability_index;
pub use ring::RingBuffer;
