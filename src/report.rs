use std::io::Write;

use serde::Serialize;

use crate::errors::AppResult;
use crate::store::{GeocodedRecord, RecordId, RecordStore};

/// A resolved record whose coordinates fell outside the target bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspiciousRecord {
    pub id: RecordId,
    pub address: String,
    pub geocoded_address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<GeocodedRecord> for SuspiciousRecord {
    fn from(record: GeocodedRecord) -> Self {
        Self {
            id: record.id,
            address: record.address,
            geocoded_address: record.geocoded_address,
            latitude: record.latitude,
            longitude: record.longitude,
        }
    }
}

pub fn suspicious_records(store: &dyn RecordStore) -> AppResult<Vec<SuspiciousRecord>> {
    Ok(store
        .list_suspicious()?
        .into_iter()
        .map(SuspiciousRecord::from)
        .collect())
}

/// Writes a header row plus one row per record; returns the row count.
pub fn write_suspicious_csv<W: Write>(records: &[SuspiciousRecord], writer: W) -> AppResult<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    if records.is_empty() {
        wtr.write_record([
            "id",
            "address",
            "geocoded_address",
            "latitude",
            "longitude",
        ])?;
    }
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressFields;
    use crate::db::open_in_memory;
    use crate::store::SqliteRecordStore;

    fn seeded_store() -> SqliteRecordStore {
        let store = SqliteRecordStore::new(open_in_memory().unwrap());
        let inside = store
            .insert_record(&AddressFields::new("1 Main St, Boston, MA"))
            .unwrap();
        let outside = store
            .insert_record(&AddressFields::new("10 Elm St, Springfield"))
            .unwrap();
        store
            .set_coordinates(inside, 42.36, -71.06, "1 Main St, Boston, MA", false)
            .unwrap();
        store
            .set_coordinates(outside, 39.78, -89.65, "10 Elm St, Springfield, MA", true)
            .unwrap();
        store
    }

    #[test]
    fn lists_only_flagged_records() {
        let store = seeded_store();
        let records = suspicious_records(&store).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "10 Elm St, Springfield");
        assert_eq!(
            records[0].geocoded_address.as_deref(),
            Some("10 Elm St, Springfield, MA")
        );
        assert_eq!(records[0].longitude, -89.65);
    }

    #[test]
    fn csv_export_quotes_addresses() {
        let store = seeded_store();
        let records = suspicious_records(&store).unwrap();
        let mut out = Vec::new();
        let rows = write_suspicious_csv(&records, &mut out).unwrap();
        assert_eq!(rows, 1);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("id,address,geocoded_address,latitude,longitude")
        );
        assert_eq!(
            lines.next(),
            Some("2,\"10 Elm St, Springfield\",\"10 Elm St, Springfield, MA\",39.78,-89.65")
        );
        assert!(lines.next().is_none());
    }

    #[test]
    fn empty_export_still_has_a_header() {
        let mut out = Vec::new();
        assert_eq!(write_suspicious_csv(&[], &mut out).unwrap(), 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,address,geocoded_address,latitude,longitude\n"
        );
    }
}
