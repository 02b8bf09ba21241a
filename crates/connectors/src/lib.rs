pub mod adapter;
pub mod dialect;
pub mod error;
pub mod factory;
pub mod memory;
pub mod sql;
