#![allow(clippy::type_complexity)]
#![warn(clippy::disallowed_types)]
#![warn(missing_docs)]
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod cache;
mod config;
mod error;
mod http;
mod pagination;
mod problems;
mod query;
mod query_options;
mod query_scope;
mod utils;

pub use cache::QueryCache;
pub use config::*;
pub use error::*;
pub use http::*;
pub use pagination::*;
pub use problems::*;
pub use query::{QueryState, QueryStatus};
pub use query_options::*;
pub use query_scope::*;
