pub mod api;
pub mod context;
pub mod controller;
pub mod data_source;
pub mod error;
pub mod persist;
pub mod registry;
pub mod runner;
