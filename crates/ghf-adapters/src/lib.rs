//! Catalog client: upstream sources and the per-cycle catalog session.
//!
//! The films endpoint's own `people` field can't be trusted, so a session rebuilds
//! each film's people from the people endpoint, which lists film references per person.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use ghf_core::{UpstreamFilm, UpstreamPerson};
use ghf_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "ghf-adapters";

pub const DEFAULT_BASE_URL: &str = "https://ghibliapi.herokuapp.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    People,
    Films,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Films => "films",
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        source: serde_json::Error,
    },
}

/// Where the raw bodies of the two catalog endpoints come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<u8>, CatalogError>;
}

#[derive(Debug)]
pub struct HttpCatalogSource {
    fetcher: HttpFetcher,
    base_url: String,
}

impl HttpCatalogSource {
    pub fn new(config: HttpClientConfig, base_url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
            base_url: base_url.into(),
        })
    }

    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint.path())
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<u8>, CatalogError> {
        let response = self.fetcher.fetch_bytes(&self.endpoint_url(endpoint)).await?;
        Ok(response.body)
    }
}

/// Reads `people.json` and `films.json` from a directory of captured responses.
#[derive(Debug, Clone)]
pub struct FixtureCatalogSource {
    dir: PathBuf,
}

impl FixtureCatalogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<u8>, CatalogError> {
        let path = self.dir.join(format!("{}.json", endpoint.path()));
        tokio::fs::read(&path)
            .await
            .map_err(|source| CatalogError::Fixture { path, source })
    }
}

/// Extracts the film id from a film reference: the last path segment of a URL or path.
///
/// Query strings and fragments are ignored. A reference whose last segment is empty,
/// such as the `/films/` collection itself, yields `None`.
pub fn film_id_from_reference(reference: &str) -> Option<&str> {
    let reference = reference.trim();
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let path = match path.split_once("://") {
        Some((_, rest)) => &rest[rest.find('/')?..],
        None => path,
    };
    let segment = path.rsplit('/').next()?;
    (!segment.is_empty()).then_some(segment)
}

/// Both upstream record sets for exactly one sync cycle.
///
/// Built once and never refreshed in place; a new cycle fetches a new session.
#[derive(Debug, Clone, Default)]
pub struct CatalogSession {
    people: Option<Vec<UpstreamPerson>>,
    films: Option<Vec<UpstreamFilm>>,
}

impl CatalogSession {
    /// Fetches people, then films. Failures are logged and leave that list absent.
    pub async fn fetch(source: &dyn CatalogSource) -> Self {
        let people = load_records::<UpstreamPerson>(source, Endpoint::People).await;
        let films = load_records::<UpstreamFilm>(source, Endpoint::Films).await;
        Self::from_parts(people, films)
    }

    pub fn from_parts(
        mut people: Option<Vec<UpstreamPerson>>,
        mut films: Option<Vec<UpstreamFilm>>,
    ) -> Self {
        if people.is_none() && films.is_some() {
            warn!("people unavailable; films keep empty people lists");
        }
        attach_people(
            people.as_deref_mut().unwrap_or_default(),
            films.as_deref_mut().unwrap_or_default(),
        );
        Self { people, films }
    }

    /// People with their `films` normalized to film ids.
    pub fn people(&self) -> Option<&[UpstreamPerson]> {
        self.people.as_deref()
    }

    /// Films with `people` rebuilt from the people endpoint.
    pub fn films(&self) -> Option<&[UpstreamFilm]> {
        self.films.as_deref()
    }
}

async fn load_records<T: DeserializeOwned>(
    source: &dyn CatalogSource,
    endpoint: Endpoint,
) -> Option<Vec<T>> {
    let body = match source.fetch(endpoint).await {
        Ok(body) => body,
        Err(err) => {
            error!(endpoint = endpoint.path(), error = %err, "catalog request failed");
            return None;
        }
    };

    let values = match serde_json::from_slice::<Vec<serde_json::Value>>(&body) {
        Ok(values) => values,
        Err(source) => {
            let err = CatalogError::Decode {
                endpoint: endpoint.path(),
                source,
            };
            error!(error = %err, "catalog response rejected");
            return None;
        }
    };

    // a malformed record costs only itself, never its siblings
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        let id = record_id(&value);
        match serde_json::from_value::<T>(value) {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                endpoint = endpoint.path(),
                id = id.as_deref().unwrap_or("<none>"),
                error = %err,
                "skipping malformed upstream record"
            ),
        }
    }
    info!(endpoint = endpoint.path(), count = records.len(), "catalog records received");
    Some(records)
}

fn record_id(value: &serde_json::Value) -> Option<String> {
    match value.get("id")? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn attach_people(people: &mut [UpstreamPerson], films: &mut [UpstreamFilm]) {
    let index: HashMap<String, usize> = films
        .iter()
        .enumerate()
        .map(|(position, film)| (film.id.clone(), position))
        .collect();
    let mut attached: Vec<HashSet<String>> = vec![HashSet::new(); films.len()];
    for film in films.iter_mut() {
        film.people.clear();
    }

    for person in people.iter_mut() {
        let mut film_ids: Vec<String> = Vec::with_capacity(person.films.len());
        for reference in &person.films {
            match film_id_from_reference(reference) {
                Some(film_id) if !film_ids.iter().any(|seen| seen == film_id) => {
                    film_ids.push(film_id.to_string())
                }
                Some(_) => {}
                None => warn!(person_id = %person.id, reference = reference.as_str(), "unusable film reference"),
            }
        }
        person.films = film_ids;

        for film_id in &person.films {
            let Some(&position) = index.get(film_id) else {
                continue;
            };
            if attached[position].insert(person.id.clone()) {
                films[position].people.push(person.clone());
            }
        }
    }
}
