mod connection;
mod params;
mod stream;
pub mod utils;

pub use connection::PgConnection;
