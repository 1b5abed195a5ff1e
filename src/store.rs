use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::venue::{OpeningHours, OperatingStatus, Provenance, VenueFields, VenueRecord};

const SELECT_VENUE: &str = "SELECT id, external_id, name, address, secondary_address, latitude,
    longitude, phone, website, rating, rating_count, price_tier, categories, operating_status,
    opening_hours, timezone, provenance, verified, verified_by, verified_at, created_at,
    updated_at, last_refreshed_at
    FROM venues";

/// A write against an existing venue.
#[derive(Debug, Clone)]
pub struct VenueUpdate {
    pub fields: VenueFields,
    /// Drop any prior verification along with the content it vouched for.
    pub clear_verification: bool,
}

/// Persistent venue storage keyed by external identifier.
pub trait VenueStore: Send + Sync {
    fn exists_by_external_id(&self, external_id: &str) -> AppResult<bool>;
    fn get_by_external_id(&self, external_id: &str) -> AppResult<Option<VenueRecord>>;
    fn insert(&self, fields: &VenueFields) -> AppResult<VenueRecord>;
    fn update(&self, external_id: &str, update: &VenueUpdate) -> AppResult<VenueRecord>;
    fn verify(&self, external_id: &str, verifier: &str) -> AppResult<VenueRecord>;
    /// Bumps `last_refreshed_at` without touching content.
    fn mark_refreshed(&self, external_id: &str) -> AppResult<()>;
    /// Venues last refreshed before `cutoff`, oldest first.
    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> AppResult<Vec<VenueRecord>>;
    fn count(&self) -> AppResult<usize>;
}

#[derive(Clone)]
pub struct SqliteVenueStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteVenueStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn fetch(conn: &Connection, external_id: &str) -> AppResult<Option<VenueRecord>> {
        conn.query_row(
            &format!("{SELECT_VENUE} WHERE external_id = ?1"),
            [external_id],
            parse_venue_row,
        )
        .optional()
        .map_err(AppError::from)
    }
}

impl VenueStore for SqliteVenueStore {
    fn exists_by_external_id(&self, external_id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM venues WHERE external_id = ?1",
                [external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_by_external_id(&self, external_id: &str) -> AppResult<Option<VenueRecord>> {
        let conn = self.db.lock();
        Self::fetch(&conn, external_id)
    }

    fn insert(&self, fields: &VenueFields) -> AppResult<VenueRecord> {
        let now = timestamp(Utc::now());
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO venues (external_id, name, address, secondary_address, latitude,
                longitude, phone, website, rating, rating_count, price_tier, categories,
                operating_status, opening_hours, timezone, provenance, verified,
                created_at, updated_at, last_refreshed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0,
                ?17, ?17, ?17)",
            params![
                fields.external_id,
                fields.name,
                fields.address,
                fields.secondary_address,
                fields.latitude,
                fields.longitude,
                fields.phone,
                fields.website,
                fields.rating,
                fields.rating_count,
                fields.price_tier,
                serialize_categories(&fields.categories)?,
                fields.operating_status.map(|status| status.as_tag()),
                serialize_hours(fields.opening_hours.as_ref())?,
                fields.timezone,
                fields.provenance.as_tag(),
                now,
            ],
        )?;
        debug!(external_id = %fields.external_id, "venue inserted");
        Self::fetch(&conn, &fields.external_id)?
            .ok_or_else(|| AppError::NotFound(fields.external_id.clone()))
    }

    fn update(&self, external_id: &str, update: &VenueUpdate) -> AppResult<VenueRecord> {
        let fields = &update.fields;
        let now = timestamp(Utc::now());
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE venues SET
                name = ?2,
                address = ?3,
                secondary_address = ?4,
                latitude = ?5,
                longitude = ?6,
                phone = ?7,
                website = ?8,
                rating = ?9,
                rating_count = ?10,
                price_tier = ?11,
                categories = ?12,
                operating_status = ?13,
                opening_hours = ?14,
                timezone = ?15,
                provenance = ?16,
                verified = CASE WHEN ?18 THEN 0 ELSE verified END,
                verified_by = CASE WHEN ?18 THEN NULL ELSE verified_by END,
                verified_at = CASE WHEN ?18 THEN NULL ELSE verified_at END,
                updated_at = ?17,
                last_refreshed_at = ?17
            WHERE external_id = ?1",
            params![
                external_id,
                fields.name,
                fields.address,
                fields.secondary_address,
                fields.latitude,
                fields.longitude,
                fields.phone,
                fields.website,
                fields.rating,
                fields.rating_count,
                fields.price_tier,
                serialize_categories(&fields.categories)?,
                fields.operating_status.map(|status| status.as_tag()),
                serialize_hours(fields.opening_hours.as_ref())?,
                fields.timezone,
                fields.provenance.as_tag(),
                now,
                update.clear_verification,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(external_id.to_string()));
        }
        debug!(external_id, "venue updated");
        Self::fetch(&conn, external_id)?.ok_or_else(|| AppError::NotFound(external_id.to_string()))
    }

    fn verify(&self, external_id: &str, verifier: &str) -> AppResult<VenueRecord> {
        let verifier = verifier.trim();
        if verifier.is_empty() {
            return Err(AppError::InvalidInput("verifier is required".into()));
        }
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE venues SET verified = 1, verified_by = ?2, verified_at = ?3
            WHERE external_id = ?1",
            params![external_id, verifier, timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(external_id.to_string()));
        }
        info!(external_id, verifier, "venue verified");
        Self::fetch(&conn, external_id)?.ok_or_else(|| AppError::NotFound(external_id.to_string()))
    }

    fn mark_refreshed(&self, external_id: &str) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE venues SET last_refreshed_at = ?2 WHERE external_id = ?1",
            params![external_id, timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(external_id.to_string()));
        }
        Ok(())
    }

    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> AppResult<Vec<VenueRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_VENUE} WHERE last_refreshed_at < ?1 ORDER BY last_refreshed_at ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![timestamp(cutoff), limit.min(i64::MAX as usize) as i64],
                parse_venue_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM venues", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn serialize_categories(categories: &BTreeSet<String>) -> AppResult<Option<String>> {
    if categories.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(categories)?))
}

fn serialize_hours(hours: Option<&OpeningHours>) -> AppResult<Option<String>> {
    hours
        .map(serde_json::to_string)
        .transpose()
        .map_err(AppError::from)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn parse_optional_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|value| serde_json::from_str(&value).map_err(|err| conversion_error(idx, err)))
        .transpose()
}

fn parse_venue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VenueRecord> {
    let status: Option<String> = row.get(13)?;
    let provenance: String = row.get(16)?;
    Ok(VenueRecord {
        id: row.get(0)?,
        fields: VenueFields {
            external_id: row.get(1)?,
            name: row.get(2)?,
            address: row.get(3)?,
            secondary_address: row.get(4)?,
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            phone: row.get(7)?,
            website: row.get(8)?,
            rating: row.get(9)?,
            rating_count: row.get(10)?,
            price_tier: row.get(11)?,
            categories: parse_json::<BTreeSet<String>>(row, 12)?.unwrap_or_default(),
            operating_status: status.as_deref().and_then(parse_status_tag),
            opening_hours: parse_json(row, 14)?,
            timezone: row.get(15)?,
            provenance: Provenance::parse(&provenance).unwrap_or(Provenance::PlacesApi),
        },
        verified: row.get(17)?,
        verified_by: row.get(18)?,
        verified_at: parse_optional_time(row, 19)?,
        created_at: parse_time(row, 20)?,
        updated_at: parse_time(row, 21)?,
        last_refreshed_at: parse_time(row, 22)?,
    })
}

fn parse_status_tag(tag: &str) -> Option<OperatingStatus> {
    match tag {
        "operational" => Some(OperatingStatus::Operational),
        "closed_temporarily" => Some(OperatingStatus::ClosedTemporarily),
        "closed_permanently" => Some(OperatingStatus::ClosedPermanently),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn memory_store() -> SqliteVenueStore {
        let connection = crate::db::open_in_memory().unwrap();
        SqliteVenueStore::new(Arc::new(Mutex::new(connection)))
    }
}
