//! Process-scoped resources for the deals pipeline: the shared HTTP fetcher and
//! the relational store boundary.

pub mod http;
pub mod memory;
pub mod postgres;
mod store;

pub use http::{FetchError, FetchResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{DealStore, StoreError, UpsertedDeal};

