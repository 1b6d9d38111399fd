//! Page fetching, raw page archival and tournament persistence.

pub mod archive;
pub mod fetch;
pub mod store;

pub use archive::{ArchivedPage, PageArchive};
pub use fetch::{FetchError, HttpClientConfig, HttpFetcher, PageSource, RawPage};
pub use store::memory::MemoryStore;
pub use store::postgres::{PostgresStore, TableNames};
pub use store::{
    DistinctField, FieldValue, Page, Pagination, StoreError, TournamentFilter, TournamentStore,
};

pub const CRATE_NAME: &str = "ctc-storage";
