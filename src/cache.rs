use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::address::CanonicalAddress;
use crate::errors::{AppError, AppResult};
use crate::geocoder::GeocodeResult;

/// Fixed-length fingerprint of a canonical address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_address(address: &CanonicalAddress) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(address.comparison_form().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct GeocodeCache {
    db: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl GeocodeCache {
    pub fn new(db: Arc<Mutex<Connection>>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expired and never-cached entries both read as `None`.
    pub fn get(&self, address: &CanonicalAddress) -> AppResult<Option<GeocodeResult>> {
        let key = CacheKey::for_address(address);
        let now = Utc::now().timestamp();
        let conn = self.db.lock();
        conn.query_row(
            "SELECT latitude, longitude, suspicious
            FROM geocode_cache
            WHERE cache_key = ?1 AND expires_at > ?2",
            (key.as_str(), now),
            |row| {
                Ok(GeocodeResult {
                    latitude: row.get(0)?,
                    longitude: row.get(1)?,
                    suspicious: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Stores or overwrites the entry for `address` with a fresh expiry.
    pub fn put(&self, address: &CanonicalAddress, result: &GeocodeResult) -> AppResult<()> {
        let key = CacheKey::for_address(address);
        let now = Utc::now();
        let expires_at = (now + self.ttl).timestamp();
        {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO geocode_cache
                    (cache_key, latitude, longitude, suspicious, canonical_address, cached_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(cache_key) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    suspicious = excluded.suspicious,
                    canonical_address = excluded.canonical_address,
                    cached_at = excluded.cached_at,
                    expires_at = excluded.expires_at",
                (
                    key.as_str(),
                    result.latitude,
                    result.longitude,
                    result.suspicious,
                    address.as_str(),
                    now.timestamp(),
                    expires_at,
                ),
            )?;
        }
        trace!(cache_key = %key, "geocode result cached");
        Ok(())
    }

    pub fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM geocode_cache WHERE expires_at <= ?1",
            [Utc::now().timestamp()],
        )?;
        Ok(removed)
    }

    pub fn entry_count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM geocode_cache WHERE expires_at > ?1",
            [Utc::now().timestamp()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}
