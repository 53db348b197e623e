//! Catalog sync pipeline: entity sync, association rebuild and the orchestrating cycle.

mod entities;
mod relations;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ghf_adapters::{
    CatalogSession, CatalogSource, FixtureCatalogSource, HttpCatalogSource, DEFAULT_BASE_URL,
};
use ghf_storage::{CatalogStore, HttpClientConfig};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use entities::{sync_entities, EntitySyncReport};
pub use relations::{collect_pairs, sync_relations, RelationSyncReport};

pub const CRATE_NAME: &str = "ghf-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_url: String,
    pub catalog_base_url: String,
    /// Read captured responses from here instead of calling the catalog API.
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ghibli.db?mode=rwc".to_string(),
            catalog_base_url: DEFAULT_BASE_URL.to_string(),
            fixtures_dir: None,
            user_agent: "ghf-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`, falling back to defaults for unset or unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            catalog_base_url: lookup("GHF_CATALOG_BASE_URL").unwrap_or(defaults.catalog_base_url),
            fixtures_dir: lookup("GHF_FIXTURES_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: lookup("GHF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("GHF_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: lookup("GHF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: lookup("SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }
}

/// The scheduler-facing result of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub people: usize,
    pub films: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub people: EntitySyncReport,
    pub films: EntitySyncReport,
    pub relations: Option<RelationSyncReport>,
}

impl SyncRunSummary {
    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            people: self.people.inserted,
            films: self.films.inserted,
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: CatalogStore,
    source: Box<dyn CatalogSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: CatalogStore, source: Box<dyn CatalogSource>) -> Self {
        Self {
            config,
            store,
            source,
        }
    }

    /// Connects and migrates the store, then picks the fixture or HTTP catalog source.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = CatalogStore::connect(&config.database_url).await?;
        store.migrate().await?;

        let source: Box<dyn CatalogSource> = match &config.fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "using captured catalog fixtures");
                Box::new(FixtureCatalogSource::new(dir.clone()))
            }
            None => Box::new(
                HttpCatalogSource::new(
                    HttpClientConfig {
                        timeout: Duration::from_secs(config.http_timeout_secs),
                        user_agent: Some(config.user_agent.clone()),
                        ..Default::default()
                    },
                    config.catalog_base_url.clone(),
                )
                .context("building catalog http client")?,
            ),
        };

        Ok(Self::new(config, store, source))
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Runs one full sync cycle. Upstream and store failures only show up as lower counts.
    pub async fn run_once(&self) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("catalog_sync", %run_id);
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> SyncRunSummary {
        let started_at = Utc::now();
        let session = CatalogSession::fetch(self.source.as_ref()).await;

        let people = match session.people() {
            Some(people) => sync_entities(&self.store, people).await,
            None => {
                warn!("people unavailable; skipping people sync");
                EntitySyncReport::default()
            }
        };
        let films = match session.films() {
            Some(films) => sync_entities(&self.store, films).await,
            None => {
                warn!("films unavailable; skipping film sync");
                EntitySyncReport::default()
            }
        };
        let relations = match session.people() {
            Some(people) => sync_relations(&self.store, people).await,
            None => None,
        };

        let finished_at = Utc::now();
        info!(
            people = people.inserted,
            films = films.inserted,
            pairs = relations.map(|r| r.pairs).unwrap_or(0),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "catalog sync finished"
        );

        SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            people,
            films,
            relations,
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let counts = pipeline.run_once().await.counts();
                info!(people = counts.people, films = counts.films, "scheduled catalog sync done");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Scheduler entry point: one cycle configured from the environment. Never fails.
pub async fn sync_catalog_from_env() -> SyncCounts {
    match SyncPipeline::from_config(SyncConfig::from_env()).await {
        Ok(pipeline) => pipeline.run_once().await.counts(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "catalog sync could not start");
            SyncCounts::default()
        }
    }
}

/// Runs scheduled cycles until Ctrl-C.
pub async fn run_scheduler_until_shutdown(mut config: SyncConfig) -> Result<()> {
    config.scheduler_enabled = true;
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        return Ok(());
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config.sync_cron, "catalog sync scheduler running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ghf_adapters::{CatalogError, Endpoint};
    use ghf_core::FilmPerson;
    use ghf_storage::FetchError;
    use std::collections::HashMap;

    struct StaticSource {
        people: Option<String>,
        films: Option<String>,
    }

    impl StaticSource {
        fn new(people: Option<serde_json::Value>, films: Option<serde_json::Value>) -> Self {
            Self {
                people: people.map(|v| v.to_string()),
                films: films.map(|v| v.to_string()),
            }
        }
    }

    #[async_trait]
    impl CatalogSource for StaticSource {
        async fn fetch(&self, endpoint: Endpoint) -> Result<Vec<u8>, CatalogError> {
            let body = match endpoint {
                Endpoint::People => &self.people,
                Endpoint::Films => &self.films,
            };
            body.as_ref().map(|b| b.as_bytes().to_vec()).ok_or_else(|| {
                CatalogError::Fetch(FetchError::HttpStatus {
                    status: 502,
                    url: endpoint.path().to_string(),
                })
            })
        }
    }

    fn person(id: &str, name: &str, films: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "gender": "Female",
            "age": "11",
            "eye_color": "Brown",
            "hair_color": "Brown",
            "films": films
        })
    }

    fn film(id: &str, release_date: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "title": format!("Film {id}"),
            "description": "-",
            "director": "Hayao Miyazaki",
            "producer": "Toshio Suzuki",
            "release_date": release_date,
            "rt_score": "93",
            "people": []
        })
    }

    async fn pipeline(source: StaticSource) -> SyncPipeline {
        let store = CatalogStore::in_memory().await.unwrap();
        SyncPipeline::new(SyncConfig::default(), store, Box::new(source))
    }

    #[tokio::test]
    async fn one_cycle_stores_entities_and_their_pair() {
        let pipeline = pipeline(StaticSource::new(
            Some(serde_json::json!([person("p1", "Satsuki", &["u/u/f1"])])),
            Some(serde_json::json!([film("f1", "1988")])),
        ))
        .await;

        let summary = pipeline.run_once().await;

        assert_eq!(summary.counts(), SyncCounts { people: 1, films: 1 });
        let store = pipeline.store();
        assert_eq!(store.person_ids().await.unwrap(), vec!["p1"]);
        assert_eq!(store.film_ids().await.unwrap(), vec!["f1"]);
        assert_eq!(
            store.film_people().await.unwrap(),
            vec![FilmPerson::new("f1", "p1")]
        );
    }

    #[tokio::test]
    async fn absent_upstream_yields_zero_counts_and_no_writes() {
        let pipeline = pipeline(StaticSource::new(None, None)).await;

        let summary = pipeline.run_once().await;

        assert_eq!(summary.counts(), SyncCounts::default());
        assert!(summary.relations.is_none());
        let store = pipeline.store();
        assert!(store.person_ids().await.unwrap().is_empty());
        assert!(store.film_ids().await.unwrap().is_empty());
        assert!(store.film_people().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_year_1800_is_rejected_and_1989_accepted() {
        let pipeline = pipeline(StaticSource::new(
            Some(serde_json::json!([])),
            Some(serde_json::json!([film("old", "1800"), film("kiki", "1989")])),
        ))
        .await;

        let summary = pipeline.run_once().await;

        assert_eq!(summary.films.rejected, 1);
        assert_eq!(summary.counts().films, 1);
        assert_eq!(pipeline.store().film_ids().await.unwrap(), vec!["kiki"]);
    }

    #[tokio::test]
    async fn second_cycle_inserts_nothing_and_keeps_associations() {
        let pipeline = pipeline(StaticSource::new(
            Some(serde_json::json!([
                person("p1", "Satsuki", &["/films/f1"]),
                person("p2", "Mei", &["/films/f1", "/films/f2"])
            ])),
            Some(serde_json::json!([film("f1", "1988"), film("f2", "1989")])),
        ))
        .await;

        assert_eq!(pipeline.run_once().await.counts(), SyncCounts { people: 2, films: 2 });
        let associations = pipeline.store().film_people().await.unwrap();

        let second = pipeline.run_once().await;
        assert_eq!(second.counts(), SyncCounts::default());
        assert_eq!(second.people.already_known, 2);
        assert_eq!(pipeline.store().film_people().await.unwrap(), associations);
        assert_eq!(associations.len(), 3);
    }

    #[tokio::test]
    async fn malformed_film_does_not_cost_its_valid_sibling() {
        let mut no_id = film("ignored", "1990");
        no_id.as_object_mut().unwrap().remove("id");
        let mut bad_score = film("bad", "1991");
        bad_score["rt_score"] = serde_json::json!(true);

        let pipeline = pipeline(StaticSource::new(
            Some(serde_json::json!([person("p1", "Pazu", &["/films/good", "/films/"])])),
            Some(serde_json::json!([film("good", "1986"), bad_score, no_id])),
        ))
        .await;

        let summary = pipeline.run_once().await;

        assert_eq!(summary.counts(), SyncCounts { people: 1, films: 1 });
        let store = pipeline.store();
        assert_eq!(store.film_ids().await.unwrap(), vec!["good"]);
        assert_eq!(
            store.film_people().await.unwrap(),
            vec![FilmPerson::new("good", "p1")]
        );
    }

    #[tokio::test]
    async fn store_outage_is_absorbed() {
        let pipeline = pipeline(StaticSource::new(
            Some(serde_json::json!([person("p1", "Satsuki", &["f1"])])),
            Some(serde_json::json!([film("f1", "1988")])),
        ))
        .await;
        pipeline.store().close().await;

        let summary = pipeline.run_once().await;

        assert_eq!(summary.counts(), SyncCounts::default());
        assert!(summary.relations.is_none());
    }

    #[tokio::test]
    async fn captured_fixtures_sync_end_to_end() {
        let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog");
        let store = CatalogStore::in_memory().await.unwrap();
        let pipeline = SyncPipeline::new(
            SyncConfig::default(),
            store,
            Box::new(FixtureCatalogSource::new(fixtures)),
        );

        let summary = pipeline.run_once().await;

        assert_eq!(summary.counts(), SyncCounts { people: 6, films: 4 });
        let relations = summary.relations.expect("relations rebuilt");
        // Haku points at a film the fixture doesn't include; the pair is kept anyway
        assert_eq!(relations.pairs, 6);

        let listing = pipeline.store().films_with_people().await.unwrap();
        let totoro = listing
            .iter()
            .find(|l| l.film.title == "My Neighbor Totoro")
            .expect("totoro");
        assert_eq!(totoro.people, vec!["Mei Kusakabe", "Satsuki Kusakabe"]);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite::memory:"),
            ("GHF_HTTP_TIMEOUT_SECS", "soon"),
            ("GHF_SCHEDULER_ENABLED", "true"),
            ("GHF_FIXTURES_DIR", "fixtures/catalog"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.http_timeout_secs, 20);
        assert!(config.scheduler_enabled);
        assert_eq!(config.fixtures_dir, Some(PathBuf::from("fixtures/catalog")));
        assert_eq!(config.catalog_base_url, DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let disabled = Arc::new(pipeline(StaticSource::new(None, None)).await);
        assert!(disabled.maybe_build_scheduler().await.unwrap().is_none());
    }

    async fn scheduled_pipeline(sync_cron: &str) -> Arc<SyncPipeline> {
        let config = SyncConfig {
            scheduler_enabled: true,
            sync_cron: sync_cron.to_string(),
            ..SyncConfig::default()
        };
        let store = CatalogStore::in_memory().await.unwrap();
        Arc::new(SyncPipeline::new(
            config,
            store,
            Box::new(StaticSource::new(None, None)),
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_cron_builds_a_scheduler() {
        let pipeline = scheduled_pipeline(&SyncConfig::default().sync_cron).await;
        let mut sched = pipeline
            .maybe_build_scheduler()
            .await
            .unwrap()
            .expect("scheduler enabled");
        sched.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unparseable_cron_is_a_setup_error() {
        let pipeline = scheduled_pipeline("every six hours").await;
        assert!(pipeline.maybe_build_scheduler().await.is_err());
    }
}
