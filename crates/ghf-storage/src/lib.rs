//! Persistence for the film catalog: the relational store plus the HTTP fetch utilities.

mod db;
mod http;

pub use db::{AssociationWrite, CatalogStore, FilmListing, StoredEntity};
pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "ghf-storage";
