pub mod algorithm;
pub mod check;
pub mod config;
pub mod datasource;
pub mod progress;
pub mod status;
