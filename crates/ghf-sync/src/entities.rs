use std::collections::BTreeMap;

use ghf_core::{CatalogEntity, UpstreamRecord};
use ghf_storage::{CatalogStore, StoredEntity};
use serde::Serialize;
use tracing::{error, info, warn};

/// What one entity sync did with an upstream list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntitySyncReport {
    pub received: usize,
    pub already_known: usize,
    pub rejected: usize,
    /// New records accepted into the insert batch. Zero if the insert itself failed.
    pub inserted: usize,
}

/// Inserts the upstream records whose ids the store doesn't know yet.
///
/// Never fails: store errors and invalid records are logged and reflected in the report.
pub async fn sync_entities<R>(store: &CatalogStore, records: &[R]) -> EntitySyncReport
where
    R: UpstreamRecord + Sync,
    R::Local: StoredEntity,
{
    let kind = <R::Local as CatalogEntity>::KIND.as_str();
    let mut report = EntitySyncReport {
        received: records.len(),
        ..Default::default()
    };

    // upstream occasionally repeats an id; the last occurrence wins
    let by_id: BTreeMap<&str, &R> = records.iter().map(|record| (record.id(), record)).collect();
    if by_id.is_empty() {
        info!(kind, "no upstream records");
        return report;
    }

    let ids: Vec<&str> = by_id.keys().copied().collect();
    let known = match store.known_ids::<R::Local>(&ids).await {
        Ok(known) => known,
        Err(err) => {
            error!(kind, error = %format!("{err:#}"), "existence lookup failed; batch skipped");
            return report;
        }
    };
    report.already_known = known.len();

    let mut batch = Vec::with_capacity(ids.len() - known.len());
    for (id, record) in by_id {
        if known.contains(id) {
            continue;
        }
        match record.to_local() {
            Ok(local) => batch.push(local),
            Err(err) => {
                report.rejected += 1;
                warn!(kind, id, error = %err, "skipping invalid upstream record");
            }
        }
    }

    if batch.is_empty() {
        info!(kind, known = report.already_known, rejected = report.rejected, "nothing new to store");
        return report;
    }

    match store.insert_ignoring_conflicts(&batch).await {
        Ok(written) => {
            report.inserted = batch.len();
            info!(kind, accepted = batch.len(), written, "stored new records");
        }
        Err(err) => {
            error!(kind, error = %format!("{err:#}"), "bulk insert failed; batch dropped");
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghf_core::{Film, Person, UpstreamFilm, UpstreamPerson};
    use serde_json::json;

    fn upstream_person(id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "gender": "Female",
            "age": "13",
            "eye_color": "Black",
            "hair_color": "Black",
            "films": []
        })
    }

    fn upstream_film(id: &str, release_date: Option<&str>) -> serde_json::Value {
        let mut film = json!({
            "id": id,
            "title": format!("Film {id}"),
            "description": "-",
            "director": "Hayao Miyazaki",
            "producer": "Toshio Suzuki",
            "rt_score": "90",
            "people": []
        });
        if let Some(year) = release_date {
            film["release_date"] = json!(year);
        }
        film
    }

    fn people(values: Vec<serde_json::Value>) -> Vec<UpstreamPerson> {
        serde_json::from_value(serde_json::Value::Array(values)).unwrap()
    }

    fn films(values: Vec<serde_json::Value>) -> Vec<UpstreamFilm> {
        serde_json::from_value(serde_json::Value::Array(values)).unwrap()
    }

    #[tokio::test]
    async fn only_unknown_ids_are_inserted() {
        let store = CatalogStore::in_memory().await.unwrap();
        let first = sync_entities(&store, &people(vec![upstream_person("A", "Sheeta")])).await;
        assert_eq!(first.inserted, 1);

        let second = sync_entities(
            &store,
            &people(vec![upstream_person("A", "Sheeta"), upstream_person("B", "Pazu")]),
        )
        .await;
        assert_eq!(
            second,
            EntitySyncReport {
                received: 2,
                already_known: 1,
                rejected: 0,
                inserted: 1
            }
        );
        assert_eq!(store.person_ids().await.unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn invalid_film_does_not_abort_its_siblings() {
        let store = CatalogStore::in_memory().await.unwrap();
        let report = sync_entities(
            &store,
            &films(vec![
                upstream_film("f1", Some("1986")),
                upstream_film("f2", None),
                upstream_film("f3", Some("1800")),
                upstream_film("f4", Some("1989")),
            ]),
        )
        .await;

        assert_eq!(report.rejected, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.film_ids().await.unwrap(), vec!["f1", "f4"]);
    }

    #[tokio::test]
    async fn repeated_upstream_id_is_inserted_once_with_last_values() {
        let store = CatalogStore::in_memory().await.unwrap();
        let report = sync_entities(
            &store,
            &people(vec![upstream_person("A", "First"), upstream_person("A", "Second")]),
        )
        .await;

        assert_eq!(report.received, 2);
        assert_eq!(report.inserted, 1);
        let stored: Vec<Person> = store.people().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Second");
    }

    #[tokio::test]
    async fn store_failure_is_absorbed() {
        let store = CatalogStore::in_memory().await.unwrap();
        store.close().await;

        let report = sync_entities(&store, &films(vec![upstream_film("f1", Some("1986"))])).await;
        assert_eq!(report.inserted, 0);
        assert_eq!(report.received, 1);
    }

    #[tokio::test]
    async fn empty_upstream_list_touches_nothing() {
        let store = CatalogStore::in_memory().await.unwrap();
        let report = sync_entities::<UpstreamFilm>(&store, &[]).await;
        assert_eq!(report, EntitySyncReport::default());
        assert!(store.known_ids::<Film>(&["f1"]).await.unwrap().is_empty());
    }
}
