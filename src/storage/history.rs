//! Sample history storage and the historical query engine
//!
//! Persists `PersistedRecord`s to the sled tree `modbus_data`. The tree
//! carries two key spaces:
//!
//! - `t` + timestamp + id → JSON record (range scans in time order)
//! - `r` + id → the `t` key of that record (lookups and deletes by id)
//!
//! Inserts go through one `sled::Batch` and deletes through one tree
//! transaction, so a reader sees a batch or a deletion entirely or not at all.

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::presets::PresetStore;
use super::{SampleStore, StorageError};
use crate::types::{FunctionCode, PersistedRecord, Sample};

const DATA_TREE: &str = "modbus_data";
const INDEX_PREFIX: u8 = b't';
const RECORD_PREFIX: u8 = b'r';

/// sled's flusher thread can outlive a dropped `Db` briefly and keep the
/// directory lock; `open` retries for up to `LOCK_RETRIES * LOCK_RETRY_DELAY`.
const LOCK_RETRIES: u32 = 80;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

type IndexKey = [u8; 17];

/// Order-preserving u64 encoding of a timestamp (signed nanos, sign bit flipped).
fn time_component(ts: DateTime<Utc>) -> u64 {
    let nanos = ts.timestamp_nanos_opt().unwrap_or(if ts.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    });
    (nanos as u64) ^ (1 << 63)
}

fn index_key(ts: DateTime<Utc>, id: u64) -> IndexKey {
    let mut key = [0u8; 17];
    key[0] = INDEX_PREFIX;
    key[1..9].copy_from_slice(&time_component(ts).to_be_bytes());
    key[9..].copy_from_slice(&id.to_be_bytes());
    key
}

fn record_key(id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = RECORD_PREFIX;
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

// ============================================================================
// Filters & Plans
// ============================================================================

/// Selection over stored records. Both time bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub slave_id: Option<u8>,
    pub address: Option<u16>,
    pub function_code: Option<FunctionCode>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            slave_id: None,
            address: None,
            function_code: None,
            limit: None,
        }
    }

    pub fn slave(mut self, slave_id: Option<u8>) -> Self {
        self.slave_id = slave_id;
        self
    }

    pub fn address(mut self, address: Option<u16>) -> Self {
        self.address = address;
        self
    }

    pub fn function_code(mut self, fc: Option<FunctionCode>) -> Self {
        self.function_code = fc;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    fn matches(&self, r: &PersistedRecord) -> bool {
        self.slave_id.map_or(true, |s| r.slave_id == s)
            && self.address.map_or(true, |a| r.address == a)
            && self.function_code.map_or(true, |fc| r.function_code == fc)
    }
}

/// Rows selected for deletion. `len()` is exactly what `commit_deletion`
/// removes unless another caller deletes some of them first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[must_use = "a deletion plan does nothing until committed"]
pub struct DeletionPlan {
    ids: Vec<u64>,
}

impl DeletionPlan {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }
}

/// Summary of the stored history.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HistoryStats {
    pub records: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub size_on_disk: u64,
}

fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(io) => {
            io.kind() == std::io::ErrorKind::WouldBlock
                || io.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

fn open_with_lock_retry(path: &Path) -> Result<sled::Db, sled::Error> {
    let mut attempt = 0;
    loop {
        match sled::open(path) {
            Err(e) if attempt < LOCK_RETRIES && is_lock_contention(&e) => {
                attempt += 1;
                debug!(path = %path.display(), attempt, "Store lock still held, retrying");
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct HistoryStore {
    db: sled::Db,
    data: sled::Tree,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::from_db(open_with_lock_retry(path)?)?;
        info!(path = %path.display(), "History store opened");
        Ok(store)
    }

    /// Throwaway store that is deleted when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let data = db.open_tree(DATA_TREE)?;
        Ok(Self { db, data })
    }

    /// Preset trees living in the same database.
    pub fn presets(&self) -> Result<PresetStore, StorageError> {
        PresetStore::from_db(&self.db)
    }

    pub fn len(&self) -> usize {
        self.data.scan_prefix([RECORD_PREFIX]).count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.scan_prefix([RECORD_PREFIX]).next().is_none()
    }

    pub fn get(&self, id: u64) -> Result<Option<PersistedRecord>, StorageError> {
        let Some(ikey) = self.data.get(record_key(id))? else {
            return Ok(None);
        };
        match self.data.get(ikey)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Records in `[start, end]`, oldest first, optionally for one slave.
    pub fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        slave_id: Option<u8>,
    ) -> Result<Vec<PersistedRecord>, StorageError> {
        self.query_filtered(&RecordFilter::range(start, end).slave(slave_id))
    }

    pub fn query_filtered(&self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>, StorageError> {
        let mut out = Vec::new();
        if filter.start > filter.end || filter.limit == Some(0) {
            return Ok(out);
        }

        let lo = index_key(filter.start, 0);
        let hi = index_key(filter.end, u64::MAX);
        for item in self.data.range(lo..=hi) {
            let (_key, value) = item?;
            let record: PersistedRecord = serde_json::from_slice(&value)?;
            if !filter.matches(&record) {
                continue;
            }
            out.push(record);
            if filter.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        debug!(rows = out.len(), "History query");
        Ok(out)
    }

    pub fn count_matching(&self, filter: &RecordFilter) -> Result<usize, StorageError> {
        Ok(self.query_filtered(filter)?.len())
    }

    /// Distinct `(slave, address, function code)` series present in storage.
    pub fn list_channels(&self) -> Result<Vec<(u8, u16, FunctionCode)>, StorageError> {
        let mut seen = BTreeSet::new();
        for item in self.data.scan_prefix([INDEX_PREFIX]) {
            let (_key, value) = item?;
            let r: PersistedRecord = serde_json::from_slice(&value)?;
            seen.insert((r.slave_id, r.address, r.function_code));
        }
        Ok(seen.into_iter().collect())
    }

    /// Select existing rows by id. Unknown ids are left out of the plan.
    pub fn plan_delete_by_ids<I>(&self, ids: I) -> Result<DeletionPlan, StorageError>
    where
        I: IntoIterator<Item = u64>,
    {
        let wanted: BTreeSet<u64> = ids.into_iter().collect();
        let mut plan = DeletionPlan::default();
        for id in wanted {
            if self.data.contains_key(record_key(id))? {
                plan.ids.push(id);
            }
        }
        Ok(plan)
    }

    /// Select every row `query(start, end, slave_id)` would return.
    pub fn plan_delete_by_query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        slave_id: Option<u8>,
    ) -> Result<DeletionPlan, StorageError> {
        self.plan_delete_filtered(&RecordFilter::range(start, end).slave(slave_id))
    }

    pub fn plan_delete_filtered(&self, filter: &RecordFilter) -> Result<DeletionPlan, StorageError> {
        let mut ids: Vec<u64> = self.query_filtered(filter)?.into_iter().map(|r| r.id).collect();
        ids.sort_unstable();
        Ok(DeletionPlan { ids })
    }

    /// Remove every row of the plan in one transaction.
    ///
    /// On error nothing is removed. Returns the number of rows deleted.
    ///
    /// A plan holds the ids matched when it was built. Rows the writer
    /// commits into the same range afterwards are not part of it and
    /// survive the commit; re-plan if the range must end up empty while
    /// acquisition is running.
    pub fn commit_deletion(&self, plan: DeletionPlan) -> Result<usize, StorageError> {
        if plan.is_empty() {
            return Ok(0);
        }
        let removed = self
            .data
            .transaction(|tx| {
                let mut removed = 0usize;
                for id in &plan.ids {
                    if let Some(ikey) = tx.remove(&record_key(*id)[..])? {
                        tx.remove(ikey)?;
                        removed += 1;
                    }
                }
                Ok::<_, ConflictableTransactionError<StorageError>>(removed)
            })
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => StorageError::from(err),
            })?;
        info!(planned = plan.len(), removed, "History rows deleted");
        Ok(removed)
    }

    pub fn delete_by_ids<I>(&self, ids: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = u64>,
    {
        self.commit_deletion(self.plan_delete_by_ids(ids)?)
    }

    pub fn delete_by_query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        slave_id: Option<u8>,
    ) -> Result<usize, StorageError> {
        self.commit_deletion(self.plan_delete_by_query(start, end, slave_id)?)
    }

    pub fn stats(&self) -> Result<HistoryStats, StorageError> {
        let timestamp_of = |item: Option<sled::Result<(sled::IVec, sled::IVec)>>| -> Result<Option<DateTime<Utc>>, StorageError> {
            match item {
                Some(entry) => {
                    let (_k, v) = entry?;
                    let r: PersistedRecord = serde_json::from_slice(&v)?;
                    Ok(Some(r.timestamp))
                }
                None => Ok(None),
            }
        };
        Ok(HistoryStats {
            records: self.len(),
            oldest: timestamp_of(self.data.scan_prefix([INDEX_PREFIX]).next())?,
            newest: timestamp_of(self.data.scan_prefix([INDEX_PREFIX]).next_back())?,
            size_on_disk: self.db.size_on_disk()?,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl SampleStore for HistoryStore {
    fn append_batch(&self, batch: &[Sample]) -> Result<Vec<u64>, StorageError> {
        let mut writes = sled::Batch::default();
        let mut ids = Vec::with_capacity(batch.len());
        for sample in batch {
            // generate_id starts at 0; ids start at 1
            let id = self.db.generate_id()? + 1;
            let record = PersistedRecord::from_sample(id, sample);
            let ikey = index_key(record.timestamp, id);
            writes.insert(&ikey[..], serde_json::to_vec(&record)?);
            writes.insert(&record_key(id)[..], &ikey[..]);
            ids.push(id);
        }
        if !ids.is_empty() {
            self.data.apply_batch(writes)?;
        }
        Ok(ids)
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.flush()
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

// ============================================================================
// Grouping
// ============================================================================

/// Split records into one `(timestamp, value)` series per register address,
/// keeping each series in input order.
pub fn group_by_address(records: &[PersistedRecord]) -> BTreeMap<u16, Vec<(DateTime<Utc>, f64)>> {
    let mut groups: BTreeMap<u16, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    for r in records {
        groups.entry(r.address).or_default().push((r.timestamp, r.value));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(slave: u8, address: u16, at: DateTime<Utc>, raw: u16) -> Sample {
        Sample {
            channel: Arc::from("ch"),
            slave_id: slave,
            address,
            function_code: FunctionCode::HoldingRegisters,
            timestamp: at,
            raw,
            value: f64::from(raw) / 10.0,
            unit: Arc::from("V"),
        }
    }

    fn seeded() -> HistoryStore {
        let store = HistoryStore::temporary().unwrap();
        let batch: Vec<Sample> = (0..10)
            .map(|i| sample(if i % 2 == 0 { 1 } else { 2 }, 100 + (i % 3) as u16, t(i), i as u16))
            .collect();
        store.append_batch(&batch).unwrap();
        store
    }

    #[test]
    fn test_time_keys_sort_chronologically() {
        let a = index_key(Utc.timestamp_opt(-5, 0).unwrap(), 9);
        let b = index_key(t(0), 1);
        let c = index_key(t(0), 2);
        let d = index_key(t(1), 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = HistoryStore::temporary().unwrap();
        let ids = store.append_batch(&[sample(1, 0, t(0), 1), sample(1, 0, t(1), 2)]).unwrap();
        assert!(ids[0] >= 1 && ids[1] > ids[0]);
        let more = store.append_batch(&[sample(1, 0, t(2), 3)]).unwrap();
        assert!(more[0] > ids[1]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(ids[1]).unwrap().unwrap().value, 0.2);
        assert!(store.append_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_query_range_order_and_slave_filter() {
        let store = seeded();
        let all = store.query(t(0), t(9), None).unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let inner = store.query(t(2), t(5), None).unwrap();
        assert_eq!(inner.len(), 4);

        let slave2 = store.query(t(0), t(9), Some(2)).unwrap();
        assert_eq!(slave2.len(), 5);
        assert!(slave2.iter().all(|r| r.slave_id == 2));

        assert!(store.query(t(5), t(2), None).unwrap().is_empty());
    }

    #[test]
    fn test_query_orders_by_timestamp_not_insertion() {
        let store = HistoryStore::temporary().unwrap();
        store.append_batch(&[sample(1, 0, t(5), 5)]).unwrap();
        store.append_batch(&[sample(1, 0, t(1), 1)]).unwrap();
        let raws: Vec<f64> = store.query(t(0), t(10), None).unwrap().iter().map(|r| r.value).collect();
        assert_eq!(raws, vec![0.1, 0.5]);
    }

    #[test]
    fn test_filtered_query_address_and_limit() {
        let store = seeded();
        let filter = RecordFilter::range(t(0), t(9)).address(Some(100));
        assert_eq!(store.count_matching(&filter).unwrap(), 4);
        let limited = store.query_filtered(&filter.limit(Some(2))).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].timestamp, t(0));
    }

    #[test]
    fn test_group_by_address() {
        let store = seeded();
        let groups = group_by_address(&store.query(t(0), t(9), None).unwrap());
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![100, 101, 102]);
        assert_eq!(groups[&100].len(), 4);
        assert!(groups[&101].windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_list_channels_distinct() {
        let store = seeded();
        let channels = store.list_channels().unwrap();
        assert_eq!(channels.len(), 6);
        assert_eq!(channels[0], (1, 100, FunctionCode::HoldingRegisters));
    }

    #[test]
    fn test_delete_by_query_then_query_is_empty() {
        let store = seeded();
        let plan = store.plan_delete_by_query(t(2), t(6), Some(1)).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(store.commit_deletion(plan).unwrap(), 3);
        assert!(store.query(t(2), t(6), Some(1)).unwrap().is_empty());
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn test_delete_by_ids_removes_exactly_those() {
        let store = seeded();
        let all = store.query(t(0), t(9), None).unwrap();
        let doomed = vec![all[1].id, all[4].id, 999_999];

        let plan = store.plan_delete_by_ids(doomed.clone()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(store.commit_deletion(plan).unwrap(), 2);

        let left: Vec<u64> = store.query(t(0), t(9), None).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(left.len(), 8);
        assert!(!left.contains(&all[1].id) && !left.contains(&all[4].id));
        assert!(store.get(all[1].id).unwrap().is_none());

        // Deleting again finds nothing
        assert_eq!(store.delete_by_ids(doomed).unwrap(), 0);
    }

    #[test]
    fn test_plan_excludes_rows_written_after_it() {
        let store = seeded();
        let plan = store.plan_delete_by_query(t(0), t(9), None).unwrap();
        assert_eq!(plan.len(), 10);

        let late = store.append_batch(&[sample(1, 100, t(5), 42)]).unwrap();
        assert_eq!(store.commit_deletion(plan).unwrap(), 10);

        let left = store.query(t(0), t(9), None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, late[0]);

        assert_eq!(store.delete_by_query(t(0), t(9), None).unwrap(), 1);
        assert!(store.query(t(0), t(9), None).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let store = seeded();
        let stats = store.stats().unwrap();
        assert_eq!(stats.records, 10);
        assert_eq!(stats.oldest, Some(t(0)));
        assert_eq!(stats.newest, Some(t(9)));

        let empty = HistoryStore::temporary().unwrap().stats().unwrap();
        assert_eq!(empty.records, 0);
        assert!(empty.oldest.is_none());
    }

    #[test]
    fn test_reopen_waits_for_lock_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let first = HistoryStore::open(&path).unwrap();
        first.append_batch(&[sample(1, 0, t(0), 1)]).unwrap();
        first.flush().unwrap();

        let holder = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            drop(first);
        });
        let second = HistoryStore::open(&path).unwrap();
        holder.join().unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_lock_error_is_recognized() {
        let err = sled::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "could not acquire lock on \"db\": Os { code: 11, kind: WouldBlock }",
        ));
        assert!(is_lock_contention(&err));
        assert!(!is_lock_contention(&sled::Error::Unsupported("x".into())));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append_batch(&[sample(1, 0, t(0) + Duration::milliseconds(1), 1)]).unwrap();
            store.flush().unwrap();
        }
        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }
}
