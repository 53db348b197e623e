//! Core catalog model: local records, upstream record shapes and their field tables.

use std::fmt;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ghf-core";

/// The studio can't have released anything before it existed.
pub const STUDIO_FOUNDED_YEAR: i32 = 1985;

/// Upstream person fields copied into the local `people` table, in column order.
pub const PERSON_FIELDS: &[&str] = &["id", "name", "gender", "age", "eye_color", "hair_color"];

/// Upstream film fields copied into the local `films` table, in column order.
pub const FILM_FIELDS: &[&str] = &[
    "id",
    "title",
    "description",
    "director",
    "producer",
    "release_date",
    "rt_score",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Film,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Film => "film",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Gender {
    /// Never fails: anything that isn't a recognised label becomes `Unknown`.
    pub fn from_upstream(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(label) if label.eq_ignore_ascii_case("male") => Self::Male,
            Some(label) if label.eq_ignore_ascii_case("female") => Self::Female,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local identity shared by every stored entity kind.
pub trait CatalogEntity {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub age: String,
    pub eye_color: String,
    pub hair_color: String,
}

impl CatalogEntity for Person {
    const KIND: EntityKind = EntityKind::Person;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Film {
    pub id: String,
    pub title: String,
    pub description: String,
    pub director: String,
    pub producer: String,
    pub release_date: i32,
    pub rt_score: i32,
}

impl CatalogEntity for Film {
    const KIND: EntityKind = EntityKind::Film;

    fn id(&self) -> &str {
        &self.id
    }
}

/// One row of the film/person association.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FilmPerson {
    pub film_id: String,
    pub person_id: String,
}

impl FilmPerson {
    pub fn new(film_id: impl Into<String>, person_id: impl Into<String>) -> Self {
        Self {
            film_id: film_id.into(),
            person_id: person_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not an integer: {value:?}")]
    NotAnInteger { field: &'static str, value: String },
    #[error("field `{field}` must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("release year {year} is outside {min}..={max}")]
    ReleaseYearOutOfRange { year: i64, min: i32, max: i32 },
}

/// Upstream scalar that may arrive as a JSON string or a JSON number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(number) => number.to_string(),
        }
    }

    pub fn to_integer(&self) -> Option<i64> {
        match self {
            Self::Text(text) => text.trim().parse().ok(),
            Self::Number(number) => number.as_i64().or_else(|| {
                number
                    .as_f64()
                    .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
                    .map(|v| v as i64)
            }),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_blank(text: String, field: &'static str) -> Result<String, RecordError> {
    if text.trim().is_empty() {
        Err(RecordError::MissingField(field))
    } else {
        Ok(text)
    }
}

fn required_text(value: &Option<Scalar>, field: &'static str) -> Result<String, RecordError> {
    let scalar = value.as_ref().ok_or(RecordError::MissingField(field))?;
    non_blank(scalar.to_text(), field)
}

fn required_integer(value: &Option<Scalar>, field: &'static str) -> Result<i64, RecordError> {
    let scalar = value.as_ref().ok_or(RecordError::MissingField(field))?;
    scalar.to_integer().ok_or_else(|| RecordError::NotAnInteger {
        field,
        value: scalar.to_text(),
    })
}

/// Upstream record that maps onto exactly one local entity.
pub trait UpstreamRecord {
    type Local: CatalogEntity;

    fn id(&self) -> &str;

    /// Builds the local record from the entity's own scalar fields only.
    fn to_local(&self) -> Result<Self::Local, RecordError>;
}

/// A record of the upstream `people` endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamPerson {
    pub id: String,
    #[serde(default)]
    pub name: Option<Scalar>,
    #[serde(default)]
    pub gender: Option<Scalar>,
    #[serde(default)]
    pub age: Option<Scalar>,
    #[serde(default)]
    pub eye_color: Option<Scalar>,
    #[serde(default)]
    pub hair_color: Option<Scalar>,
    /// Film references as sent upstream (URLs); film ids once the catalog session repaired them.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub films: Vec<String>,
}

impl UpstreamRecord for UpstreamPerson {
    type Local = Person;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_local(&self) -> Result<Person, RecordError> {
        let gender_label = self.gender.as_ref().map(Scalar::to_text);
        Ok(Person {
            id: non_blank(self.id.clone(), "id")?,
            name: required_text(&self.name, "name")?,
            gender: Gender::from_upstream(gender_label.as_deref()),
            // blank ages are legitimate upstream, only absence is an error
            age: self
                .age
                .as_ref()
                .map(Scalar::to_text)
                .ok_or(RecordError::MissingField("age"))?,
            eye_color: required_text(&self.eye_color, "eye_color")?,
            hair_color: required_text(&self.hair_color, "hair_color")?,
        })
    }
}

/// Inclusive range of acceptable film release years.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseWindow {
    pub min: i32,
    pub max: i32,
}

impl ReleaseWindow {
    pub fn for_year(current_year: i32) -> Self {
        Self {
            min: STUDIO_FOUNDED_YEAR,
            max: current_year + 1,
        }
    }

    pub fn current() -> Self {
        Self::for_year(Utc::now().year())
    }

    pub fn check(&self, year: i64) -> Result<i32, RecordError> {
        if year < i64::from(self.min) || year > i64::from(self.max) {
            return Err(RecordError::ReleaseYearOutOfRange {
                year,
                min: self.min,
                max: self.max,
            });
        }
        Ok(year as i32)
    }
}

/// A record of the upstream `films` endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamFilm {
    pub id: String,
    #[serde(default)]
    pub title: Option<Scalar>,
    #[serde(default)]
    pub description: Option<Scalar>,
    #[serde(default)]
    pub director: Option<Scalar>,
    #[serde(default)]
    pub producer: Option<Scalar>,
    #[serde(default)]
    pub release_date: Option<Scalar>,
    #[serde(default)]
    pub rt_score: Option<Scalar>,
    /// The upstream `people` field is unreliable and never read; this list is
    /// filled from the people endpoint by the catalog session.
    #[serde(skip)]
    pub people: Vec<UpstreamPerson>,
}

impl UpstreamFilm {
    pub fn to_film(&self, window: ReleaseWindow) -> Result<Film, RecordError> {
        let release_date = window.check(required_integer(&self.release_date, "release_date")?)?;
        let rt_score = required_integer(&self.rt_score, "rt_score")?;
        if rt_score < 0 {
            return Err(RecordError::Negative {
                field: "rt_score",
                value: rt_score,
            });
        }
        let rt_score = i32::try_from(rt_score).map_err(|_| RecordError::NotAnInteger {
            field: "rt_score",
            value: rt_score.to_string(),
        })?;

        Ok(Film {
            id: non_blank(self.id.clone(), "id")?,
            title: required_text(&self.title, "title")?,
            description: required_text(&self.description, "description")?,
            director: required_text(&self.director, "director")?,
            producer: required_text(&self.producer, "producer")?,
            release_date,
            rt_score,
        })
    }
}

impl UpstreamRecord for UpstreamFilm {
    type Local = Film;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_local(&self) -> Result<Film, RecordError> {
        self.to_film(ReleaseWindow::current())
    }
}
