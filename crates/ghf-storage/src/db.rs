use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use ghf_core::{CatalogEntity, Film, FilmPerson, Gender, Person, FILM_FIELDS, PERSON_FIELDS};
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

/// Keeps every statement well under SQLite's bound-parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 200;

/// An entity kind with its own table keyed by a text `id` column.
pub trait StoredEntity: CatalogEntity + Send + Sync {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Binds one value per entry of `COLUMNS`, in the same order.
    fn bind_row<'qb, 'args: 'qb>(&self, row: &mut Separated<'qb, 'args, Sqlite, &'static str>);
}

impl StoredEntity for Person {
    const TABLE: &'static str = "people";
    const COLUMNS: &'static [&'static str] = PERSON_FIELDS;

    fn bind_row<'qb, 'args: 'qb>(&self, row: &mut Separated<'qb, 'args, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.gender.as_str().to_string())
            .push_bind(self.age.clone())
            .push_bind(self.eye_color.clone())
            .push_bind(self.hair_color.clone());
    }
}

impl StoredEntity for Film {
    const TABLE: &'static str = "films";
    const COLUMNS: &'static [&'static str] = FILM_FIELDS;

    fn bind_row<'qb, 'args: 'qb>(&self, row: &mut Separated<'qb, 'args, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.title.clone())
            .push_bind(self.description.clone())
            .push_bind(self.director.clone())
            .push_bind(self.producer.clone())
            .push_bind(self.release_date)
            .push_bind(self.rt_score);
    }
}

/// Row counts written by one association rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssociationWrite {
    pub deleted: u64,
    pub inserted: u64,
}

/// A stored film with the names of its associated people.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilmListing {
    pub film: Film,
    pub people: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);

        // every connection to an in-memory database sees its own empty database
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Fresh, migrated in-memory store.
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying catalog migrations")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Returns the subset of `ids` already stored for `E`, in one query per chunk of ids.
    pub async fn known_ids<E: StoredEntity>(&self, ids: &[&str]) -> Result<HashSet<String>> {
        let mut known = HashSet::new();
        for chunk in ids.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT id FROM {} WHERE id IN (", E::TABLE));
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = qb
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("looking up known {} ids", E::KIND))?;
            known.extend(rows);
        }
        Ok(known)
    }

    /// Inserts `records`, silently skipping any whose id already exists. Returns rows written.
    pub async fn insert_ignoring_conflicts<E: StoredEntity>(&self, records: &[E]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("opening {} insert transaction", E::KIND))?;
        let mut written = 0;
        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} ({}) ",
                E::TABLE,
                E::COLUMNS.join(", ")
            ));
            qb.push_values(chunk, |mut row, record| record.bind_row(&mut row));
            qb.push(" ON CONFLICT (id) DO NOTHING");
            written += qb
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting {} rows", E::KIND))?
                .rows_affected();
        }
        tx.commit()
            .await
            .with_context(|| format!("committing {} insert", E::KIND))?;

        debug!(kind = E::KIND.as_str(), attempted = records.len(), written, "bulk insert finished");
        Ok(written)
    }

    /// Replaces the associations of every film named in `pairs` with exactly `pairs`.
    ///
    /// Delete and insert share one transaction; on any error nothing is changed.
    pub async fn replace_film_people(&self, pairs: &BTreeSet<FilmPerson>) -> Result<AssociationWrite> {
        if pairs.is_empty() {
            return Ok(AssociationWrite::default());
        }

        let film_ids: Vec<&str> = pairs
            .iter()
            .map(|pair| pair.film_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let pairs: Vec<&FilmPerson> = pairs.iter().collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening association transaction")?;
        let mut write = AssociationWrite::default();

        for chunk in film_ids.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM film_people WHERE film_id IN (");
            let mut separated = qb.separated(", ");
            for film_id in chunk {
                separated.push_bind(film_id.to_string());
            }
            separated.push_unseparated(")");
            write.deleted += qb
                .build()
                .execute(&mut *tx)
                .await
                .context("deleting stale associations")?
                .rows_affected();
        }

        for chunk in pairs.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO film_people (film_id, person_id) ");
            qb.push_values(chunk, |mut row, pair| {
                row.push_bind(pair.film_id.clone())
                    .push_bind(pair.person_id.clone());
            });
            qb.push(" ON CONFLICT (film_id, person_id) DO NOTHING");
            write.inserted += qb
                .build()
                .execute(&mut *tx)
                .await
                .context("inserting associations")?
                .rows_affected();
        }

        tx.commit().await.context("committing associations")?;
        Ok(write)
    }

    pub async fn person_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT id FROM people ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("listing people ids")
    }

    pub async fn film_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT id FROM films ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("listing film ids")
    }

    pub async fn film_people(&self) -> Result<Vec<FilmPerson>> {
        let rows = sqlx::query("SELECT film_id, person_id FROM film_people ORDER BY film_id, person_id")
            .fetch_all(&self.pool)
            .await
            .context("listing associations")?;
        rows.iter()
            .map(|row| {
                Ok::<_, anyhow::Error>(FilmPerson {
                    film_id: row.try_get("film_id")?,
                    person_id: row.try_get("person_id")?,
                })
            })
            .collect()
    }

    pub async fn people(&self) -> Result<Vec<Person>> {
        let rows = sqlx::query(
            "SELECT id, name, gender, age, eye_color, hair_color FROM people ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing people")?;
        rows.iter()
            .map(|row| {
                let gender: String = row.try_get("gender")?;
                Ok::<_, anyhow::Error>(Person {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    gender: Gender::from_upstream(Some(gender.as_str())),
                    age: row.try_get("age")?,
                    eye_color: row.try_get("eye_color")?,
                    hair_color: row.try_get("hair_color")?,
                })
            })
            .collect()
    }

    /// Stored films ordered by release year, each with the sorted names of its people.
    pub async fn films_with_people(&self) -> Result<Vec<FilmListing>> {
        let film_rows = sqlx::query(
            "SELECT id, title, description, director, producer, release_date, rt_score \
             FROM films ORDER BY release_date, title",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing films")?;

        let name_rows = sqlx::query(
            "SELECT fp.film_id, p.name FROM film_people fp \
             JOIN people p ON p.id = fp.person_id ORDER BY p.name",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing film people")?;

        let mut names: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &name_rows {
            let film_id: String = row.try_get("film_id")?;
            names.entry(film_id).or_default().push(row.try_get("name")?);
        }

        film_rows
            .iter()
            .map(|row| {
                let film = Film {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    director: row.try_get("director")?,
                    producer: row.try_get("producer")?,
                    release_date: row.try_get("release_date")?,
                    rt_score: row.try_get("rt_score")?,
                };
                let people = names.remove(&film.id).unwrap_or_default();
                Ok::<_, anyhow::Error>(FilmListing { film, people })
            })
            .collect()
    }
}
