pub mod barrier;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod repository;
pub mod retry;
