use crate::{pagination::position::Position, records::row::RowData};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A page of inventory rows read from one unit, with the positions it spans.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub rows: Vec<RowData>,
    pub cursor: Position, // position this batch was read from
    pub next: Position,   // resume-from position once the batch is committed
    pub manifest: Manifest,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    pub row_count: usize,
    pub checksum_xxh3: u64, // rolling checksum over canonicalized rows
}

pub fn manifest_for(rows: &[RowData]) -> Manifest {
    let mut h: u64 = 0;
    for r in rows {
        h = xxh3_64_with_seed(&r.canonical_bytes(), h);
    }
    Manifest {
        row_count: rows.len(),
        checksum_xxh3: h,
    }
}

impl Batch {
    pub fn new(id: String, rows: Vec<RowData>, cursor: Position, next: Position) -> Self {
        let manifest = manifest_for(&rows);
        Self {
            id,
            rows,
            cursor,
            next,
            manifest,
            ts: chrono::Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.rows.iter().map(|r| r.size_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::row::FieldValue;

    #[test]
    fn checksum_depends_on_row_order() {
        let a = RowData::new("t", vec![FieldValue::new("id", 1)]);
        let b = RowData::new("t", vec![FieldValue::new("id", 2)]);
        let forward = manifest_for(&[a.clone(), b.clone()]);
        let reverse = manifest_for(&[b, a]);
        assert_eq!(forward.row_count, 2);
        assert_ne!(forward.checksum_xxh3, reverse.checksum_xxh3);
        assert_eq!(manifest_for(&[]).checksum_xxh3, 0);
    }
}
