pub mod check;
pub mod migration;
