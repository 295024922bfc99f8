pub mod book;
pub mod cache;
pub mod config;
pub mod registry;
pub mod scheduler;
pub mod throttle;
pub mod types;

pub use book::{BookManager, BookState, DiffOutcome, LocalBook, ReplayError};
pub use cache::DepthCache;
pub use registry::{ClientCommand, ClientRegistry};
pub use scheduler::{SnapshotScheduler, SnapshotSource};
pub use throttle::RestThrottle;
pub use types::*;
