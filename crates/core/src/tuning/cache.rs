//! Signature-keyed store of tuning decisions.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::Result;
use crate::tuning::format;
use crate::tuning::signature::{ProblemSignature, TuningRecord};

/// Map from problem signature to the best-known variant.
///
/// Inserts are last-write-wins. Iteration order for export is the
/// signature order, so exported files are byte-stable for equal contents.
#[derive(Debug, Clone, Default)]
pub struct TuningCache {
    records: HashMap<ProblemSignature, TuningRecord>,
}

impl TuningCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, signature: &ProblemSignature) -> Option<&TuningRecord> {
        self.records.get(signature)
    }

    /// Insert or overwrite. Returns the record that was replaced, if any.
    pub fn insert(&mut self, record: TuningRecord) -> Option<TuningRecord> {
        self.records.insert(record.signature, record)
    }

    /// Insert every record, overwriting equal signatures. Returns the count.
    pub fn extend<I: IntoIterator<Item = TuningRecord>>(&mut self, records: I) -> usize {
        let mut n = 0;
        for record in records {
            self.insert(record);
            n += 1;
        }
        n
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// All records sorted by signature.
    pub fn records(&self) -> Vec<&TuningRecord> {
        let mut records: Vec<&TuningRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.signature.cmp(&b.signature));
        records
    }

    /// Serialize every record. Returns the number of records written.
    pub fn export<W: Write>(&self, writer: &mut W) -> Result<usize> {
        format::write_records(writer, self.records().into_iter())
    }

    /// Read a full stream and merge it in. A malformed stream leaves the
    /// cache untouched.
    pub fn import<R: Read>(&mut self, reader: &mut R) -> Result<usize> {
        let records = format::read_records(reader)?;
        Ok(self.extend(records))
    }
}
