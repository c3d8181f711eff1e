use std::collections::HashSet;
use std::path::Path;

use csv::StringRecord;
use tracing::warn;

use crate::errors::{AppError, AppResult};

pub const ID_COLUMN: &str = "id";
pub const ADDRESS_COLUMN: &str = "address";

/// A listing queued for geocoding: the first row carrying a given non-blank id.
#[derive(Debug, Clone)]
pub struct Listing {
    pub id: String,
    pub address: String,
}

/// Every data row of the source table in input order, queued or not, so the
/// reconciler can write all of them back with their columns untouched.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: String,
    pub record: StringRecord,
}

#[derive(Debug, Clone)]
pub struct ListingTable {
    pub headers: StringRecord,
    pub rows: Vec<SourceRow>,
    pub listings: Vec<Listing>,
}

impl ListingTable {
    pub fn load(path: &Path) -> AppResult<Self> {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|err| AppError::Input(format!("{}: {err}", path.display())))?;
        Self::from_reader(reader)
    }

    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> AppResult<Self> {
        let headers = reader.headers()?.clone();
        let id_idx = column_index(&headers, ID_COLUMN)?;
        let address_idx = column_index(&headers, ADDRESS_COLUMN)?;

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        let mut listings = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let id = record.get(id_idx).unwrap_or_default().trim().to_string();
            if id.is_empty() {
                warn!(line = line + 2, "listing row without id will not be geocoded");
            } else if !seen.insert(id.clone()) {
                warn!(listing_id = %id, line = line + 2, "duplicate listing id; geocoding the first row only");
            } else {
                listings.push(Listing {
                    id: id.clone(),
                    address: record.get(address_idx).unwrap_or_default().to_string(),
                });
            }
            rows.push(SourceRow { id, record });
        }

        Ok(Self {
            headers,
            rows,
            listings,
        })
    }

    /// Listings queued for geocoding.
    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

fn column_index(headers: &StringRecord, name: &str) -> AppResult<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
        .ok_or_else(|| AppError::Input(format!("missing required column `{name}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv_text: &str) -> AppResult<ListingTable> {
        ListingTable::from_reader(
            csv::ReaderBuilder::new()
                .flexible(true)
                .from_reader(csv_text.as_bytes()),
        )
    }

    #[test]
    fn loads_rows_with_passthrough_columns() {
        let table = table(
            "id,price,address,beds\n\
             A1,1500,\"100 Main St Unit 4, Austin, TX 78701\",2\n\
             B2,900,,1\n",
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.listings[0].id, "A1");
        assert_eq!(
            table.listings[0].address,
            "100 Main St Unit 4, Austin, TX 78701"
        );
        assert_eq!(table.rows[0].record.get(3), Some("2"));
        assert_eq!(table.listings[1].address, "");
    }

    #[test]
    fn queues_unique_ids_but_keeps_every_row() {
        let table = table("id,address\nA1,one\n,two\nA1,three\nC3,four\n").unwrap();
        let ids: Vec<_> = table.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "C3"]);
        assert_eq!(table.listings[0].address, "one");

        assert_eq!(table.row_count(), 4);
        let row_ids: Vec<_> = table.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(row_ids, vec!["A1", "", "A1", "C3"]);
        assert_eq!(&table.rows[2].record[1], "three");
    }

    #[test]
    fn requires_id_and_address_columns() {
        let err = table("listing,address\nA1,one\n").unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
        let err = table("id,street\nA1,one\n").unwrap_err();
        assert!(err.to_string().contains("address"));
    }
}
