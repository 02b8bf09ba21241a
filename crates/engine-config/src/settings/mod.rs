pub mod error;
pub mod job;
pub mod process;
pub mod task;
