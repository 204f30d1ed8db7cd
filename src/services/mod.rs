pub mod executor;
pub mod preview;
pub mod progress;
pub mod queue;
pub mod reconciler;
pub mod render;
pub mod store;
pub mod worker;
