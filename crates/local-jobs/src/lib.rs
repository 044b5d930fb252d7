//! Run Creel jobs as local processes. This is mostly useful for testing and development.

pub mod spawner;

pub use spawner::LocalExecutor;
