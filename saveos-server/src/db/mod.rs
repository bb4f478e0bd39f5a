pub mod connection;
pub mod migrate;

pub use connection::{close_pool, create_pool, DbPool};
pub use migrate::migrate;
