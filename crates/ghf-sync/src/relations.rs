use std::collections::BTreeSet;

use ghf_core::{FilmPerson, UpstreamPerson};
use ghf_storage::CatalogStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelationSyncReport {
    /// Films whose associations were rebuilt.
    pub films: usize,
    pub pairs: usize,
    pub deleted: u64,
    pub inserted: u64,
}

/// Every (film, person) pair implied by the people's normalized film ids.
pub fn collect_pairs(people: &[UpstreamPerson]) -> BTreeSet<FilmPerson> {
    people
        .iter()
        .flat_map(|person| {
            person
                .films
                .iter()
                .map(move |film_id| FilmPerson::new(film_id.clone(), person.id.clone()))
        })
        .collect()
}

/// Rebuilds the associations of every film the people list mentions.
///
/// Runs whether or not any entity was new this cycle, so upstream relinking is
/// picked up too. Films the people list doesn't mention keep what they have.
/// Returns `None` when there was nothing to write or the rebuild failed.
pub async fn sync_relations(
    store: &CatalogStore,
    people: &[UpstreamPerson],
) -> Option<RelationSyncReport> {
    let pairs = collect_pairs(people);
    if pairs.is_empty() {
        info!("no film/person pairs upstream");
        return None;
    }

    let films = pairs
        .iter()
        .map(|pair| pair.film_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    match store.replace_film_people(&pairs).await {
        Ok(write) => {
            info!(films, pairs = pairs.len(), deleted = write.deleted, inserted = write.inserted, "associations rebuilt");
            Some(RelationSyncReport {
                films,
                pairs: pairs.len(),
                deleted: write.deleted,
                inserted: write.inserted,
            })
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "association rebuild failed; previous associations kept");
            None
        }
    }
}
