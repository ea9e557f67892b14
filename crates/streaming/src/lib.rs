pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod query;
pub mod transport;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use fetcher::*;
pub use query::*;
pub use transport::*;
