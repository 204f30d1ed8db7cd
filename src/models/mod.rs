pub mod job;
pub mod render;
