pub mod batch;
pub mod change;
pub mod row;
