pub mod core;
pub mod job;
pub mod pagination;
pub mod records;
