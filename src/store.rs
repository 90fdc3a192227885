use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::address::AddressFields;
use crate::db::now_timestamp;
use crate::errors::{AppError, AppResult};

pub type RecordId = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCoordinates {
    pub latitude: f64,
    pub longitude: f64,
    pub geocoded_address: Option<String>,
    pub suspicious: bool,
}

/// A record that already carries coordinates, as listed for review or sweeps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodedRecord {
    pub id: RecordId,
    pub address: String,
    pub geocoded_address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub suspicious: bool,
}

/// Property-record storage as seen by the geocoding pipeline.
pub trait RecordStore: Send + Sync {
    /// Ids lacking coordinates, at most `limit`, in processing order.
    fn list_needing_geocode(&self, limit: usize) -> AppResult<Vec<RecordId>>;
    fn backlog_size(&self) -> AppResult<usize>;
    fn address_fields(&self, id: RecordId) -> AppResult<Option<AddressFields>>;
    fn stored_coordinates(&self, id: RecordId) -> AppResult<Option<StoredCoordinates>>;
    fn set_coordinates(
        &self,
        id: RecordId,
        latitude: f64,
        longitude: f64,
        source_address: &str,
        suspicious: bool,
    ) -> AppResult<()>;
    /// Notes a failed attempt; the record stays in the backlog.
    fn record_failure(&self, id: RecordId, reason: &str) -> AppResult<()>;
    fn list_geocoded(&self) -> AppResult<Vec<GeocodedRecord>>;
    fn set_suspicious(&self, id: RecordId, suspicious: bool) -> AppResult<()>;
    fn list_suspicious(&self) -> AppResult<Vec<GeocodedRecord>>;
}

/// Persisted boolean flags that survive process restarts.
pub trait FlagStore: Send + Sync {
    fn get_flag(&self, name: &str) -> AppResult<Option<bool>>;
    fn set_flag(&self, name: &str, value: bool) -> AppResult<()>;
    fn delete_flag(&self, name: &str) -> AppResult<()>;
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn insert_record(&self, fields: &AddressFields) -> AppResult<RecordId> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO properties (address, city, region, postal_code) VALUES (?1, ?2, ?3, ?4)",
            (
                fields.address.as_str(),
                fields.city.as_str(),
                fields.region.as_str(),
                fields.postal_code.as_str(),
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Replaces the address columns; existing coordinates are kept until re-resolved.
    pub fn update_address(&self, id: RecordId, fields: &AddressFields) -> AppResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE properties
            SET address = ?2, city = ?3, region = ?4, postal_code = ?5, updated_at = DATETIME('now')
            WHERE id = ?1",
            (
                id,
                fields.address.as_str(),
                fields.city.as_str(),
                fields.region.as_str(),
                fields.postal_code.as_str(),
            ),
        )?;
        ensure_updated(updated, id)
    }

    pub fn failure_reason(&self, id: RecordId) -> AppResult<Option<String>> {
        let conn = self.db.lock();
        let reason: Option<Option<String>> = conn
            .query_row(
                "SELECT geocode_failure FROM properties WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason.flatten())
    }

    fn list_geocoded_where(&self, filter: &str) -> AppResult<Vec<GeocodedRecord>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT id, address, geocoded_address, latitude, longitude, suspicious
            FROM properties
            WHERE latitude IS NOT NULL AND longitude IS NOT NULL {filter}
            ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], geocoded_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl RecordStore for SqliteRecordStore {
    fn list_needing_geocode(&self, limit: usize) -> AppResult<Vec<RecordId>> {
        let conn = self.db.lock();
        // Never-attempted records first, then the least recently attempted.
        let mut stmt = conn.prepare(
            "SELECT id FROM properties
            WHERE latitude IS NULL OR longitude IS NULL
            ORDER BY geocode_attempted_at IS NOT NULL, geocode_attempted_at ASC, id ASC
            LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([sql_limit(limit)], |row| row.get(0))?
            .collect::<Result<Vec<RecordId>, _>>()?;
        Ok(ids)
    }

    fn backlog_size(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM properties WHERE latitude IS NULL OR longitude IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn address_fields(&self, id: RecordId) -> AppResult<Option<AddressFields>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT address, city, region, postal_code FROM properties WHERE id = ?1",
            [id],
            |row| {
                Ok(AddressFields {
                    address: row.get(0)?,
                    city: row.get(1)?,
                    region: row.get(2)?,
                    postal_code: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn stored_coordinates(&self, id: RecordId) -> AppResult<Option<StoredCoordinates>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT latitude, longitude, geocoded_address, suspicious
            FROM properties
            WHERE id = ?1 AND latitude IS NOT NULL AND longitude IS NOT NULL",
            [id],
            |row| {
                Ok(StoredCoordinates {
                    latitude: row.get(0)?,
                    longitude: row.get(1)?,
                    geocoded_address: row.get(2)?,
                    suspicious: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn set_coordinates(
        &self,
        id: RecordId,
        latitude: f64,
        longitude: f64,
        source_address: &str,
        suspicious: bool,
    ) -> AppResult<()> {
        let now = now_timestamp();
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE properties
            SET latitude = ?2,
                longitude = ?3,
                geocoded_address = ?4,
                suspicious = ?5,
                geocoded_at = ?6,
                geocode_attempted_at = ?6,
                geocode_failure = NULL
            WHERE id = ?1",
            (id, latitude, longitude, source_address, suspicious, now),
        )?;
        ensure_updated(updated, id)
    }

    fn record_failure(&self, id: RecordId, reason: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE properties SET geocode_attempted_at = ?2, geocode_failure = ?3 WHERE id = ?1",
            (id, now_timestamp(), reason),
        )?;
        Ok(())
    }

    fn list_geocoded(&self) -> AppResult<Vec<GeocodedRecord>> {
        self.list_geocoded_where("")
    }

    fn set_suspicious(&self, id: RecordId, suspicious: bool) -> AppResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE properties SET suspicious = ?2 WHERE id = ?1",
            (id, suspicious),
        )?;
        ensure_updated(updated, id)
    }

    fn list_suspicious(&self) -> AppResult<Vec<GeocodedRecord>> {
        self.list_geocoded_where("AND suspicious = 1")
    }
}

fn geocoded_from_row(row: &Row<'_>) -> rusqlite::Result<GeocodedRecord> {
    Ok(GeocodedRecord {
        id: row.get(0)?,
        address: row.get(1)?,
        geocoded_address: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        suspicious: row.get(5)?,
    })
}

/// SQLite treats a negative LIMIT as unbounded, so never let the cast wrap.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn ensure_updated(updated: usize, id: RecordId) -> AppResult<()> {
    if updated == 0 {
        return Err(AppError::NotFound(format!("property {id}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteFlagStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteFlagStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl FlagStore for SqliteFlagStore {
    fn get_flag(&self, name: &str) -> AppResult<Option<bool>> {
        let conn = self.db.lock();
        conn.query_row("SELECT value FROM app_flags WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()
        .map_err(AppError::from)
    }

    fn set_flag(&self, name: &str, value: bool) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO app_flags (name, value, updated_at) VALUES (?1, ?2, DATETIME('now'))
            ON CONFLICT(name) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            (name, value),
        )?;
        Ok(())
    }

    fn delete_flag(&self, name: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute("DELETE FROM app_flags WHERE name = ?1", [name])?;
        Ok(())
    }
}
