//! Per-`convert_id` delivery telemetry.
//!
//! Every range request served for an identifier appends one [`RangeRecord`]
//! to that identifier's [`TransferRecord`]. Records are created on first use
//! and never evicted, so memory grows with the number of distinct
//! identifiers seen by the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

use crate::human;
use crate::range::ByteRange;

/// Aggregate delivery record for one identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRecord {
    #[serde(rename = "time_start_ns")]
    pub start_time_ns: i64,
    #[serde(rename = "time_end_ns")]
    pub end_time_ns: i64,
    #[serde(rename = "time_duration")]
    pub duration: String,
    pub file_size: u64,
    pub file_size_human: String,
    pub ranges: Vec<RangeRecord>,
}

/// One range request within a transfer.
///
/// The delivery fields stay zero-valued until the transfer of this range
/// completes or is aborted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeRecord {
    #[serde(rename = "byte_start")]
    pub start_byte: u64,
    /// `None` when the end was left open or reached the end of the file.
    #[serde(rename = "byte_end", serialize_with = "end_or_sentinel")]
    pub end_byte: Option<u64>,
    #[serde(rename = "request_len")]
    pub requested_len: u64,
    #[serde(rename = "request_len_human")]
    pub requested_len_human: String,
    pub returned_bytes: u64,
    pub returned_bytes_human: String,
    #[serde(rename = "returned_perc")]
    pub returned_percent: f64,
    #[serde(rename = "time_start_ns")]
    pub start_time_ns: i64,
    #[serde(rename = "time_end_ns")]
    pub end_time_ns: i64,
    #[serde(rename = "time_duration")]
    pub duration: String,
    pub client_cancelled: bool,
    #[serde(rename = "client_addr")]
    pub remote_addr: String,
}

// open ends go over the wire as -1
fn end_or_sentinel<S: Serializer>(end: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    match end {
        Some(end) => serializer.serialize_u64(*end),
        None => serializer.serialize_i64(-1),
    }
}

/// Locates the [`RangeRecord`] appended by [`TransferTracker::begin`].
///
/// Ranges are only ever appended, so the position stays valid for the
/// lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeSlot(usize);

/// How a single range transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub returned_bytes: u64,
    pub end_time_ns: i64,
    pub client_cancelled: bool,
}

/// Shared identifier to record map. Cheap to clone, all clones see the same
/// records.
#[derive(Debug, Clone, Default)]
pub struct TransferTracker {
    records: Arc<Mutex<HashMap<String, TransferRecord>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // Records are plain data, a panic while the lock was held cannot leave
    // one structurally invalid, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TransferRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a pending range record for `id`, creating the transfer record
    /// on first use. `file_size` and `start_time_ns` only take effect for the
    /// first range seen for `id`.
    pub fn begin(
        &self,
        id: &str,
        file_size: u64,
        range: &ByteRange,
        end_byte: Option<u64>,
        remote_addr: &str,
        start_time_ns: i64,
    ) -> RangeSlot {
        let requested_len = range.len();
        let entry = RangeRecord {
            start_byte: range.start,
            end_byte,
            requested_len,
            requested_len_human: human::bytes(requested_len),
            returned_bytes: 0,
            returned_bytes_human: String::new(),
            returned_percent: 0.0,
            start_time_ns,
            end_time_ns: 0,
            duration: String::new(),
            client_cancelled: false,
            remote_addr: remote_addr.to_string(),
        };

        let mut records = self.lock();
        let record = records.entry(id.to_string()).or_insert_with(|| TransferRecord {
            start_time_ns,
            end_time_ns: 0,
            duration: String::new(),
            file_size,
            file_size_human: human::bytes(file_size),
            ranges: Vec::new(),
        });
        record.ranges.push(entry);
        RangeSlot(record.ranges.len() - 1)
    }

    /// Fills in the outcome of the range at `slot` and advances the parent's
    /// end time. Unknown identifiers or slots are ignored.
    pub fn finalize(&self, id: &str, slot: RangeSlot, delivered: Delivered) {
        let mut records = self.lock();
        let Some(record) = records.get_mut(id) else {
            return;
        };
        let Some(range) = record.ranges.get_mut(slot.0) else {
            return;
        };

        range.returned_bytes = delivered.returned_bytes;
        range.returned_bytes_human = human::bytes(delivered.returned_bytes);
        if range.requested_len > 0 {
            range.returned_percent =
                delivered.returned_bytes as f64 / range.requested_len as f64 * 100.0;
        }
        range.end_time_ns = delivered.end_time_ns;
        range.client_cancelled = delivered.client_cancelled;
        range.duration = elapsed(range.start_time_ns, range.end_time_ns);

        if delivered.end_time_ns > record.end_time_ns {
            record.end_time_ns = delivered.end_time_ns;
        }
        if record.end_time_ns > record.start_time_ns {
            record.duration = elapsed(record.start_time_ns, record.end_time_ns);
        }
    }

    /// Copy of the current record for `id`, possibly with ranges still in
    /// flight.
    pub fn snapshot(&self, id: &str) -> Option<TransferRecord> {
        self.lock().get(id).cloned()
    }
}

fn elapsed(start_ns: i64, end_ns: i64) -> String {
    let nanos = u64::try_from(end_ns.saturating_sub(start_ns)).unwrap_or(0);
    human::duration(Duration::from_nanos(nanos))
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    fn delivered(returned_bytes: u64, end_time_ns: i64) -> Delivered {
        Delivered { returned_bytes, end_time_ns, client_cancelled: false }
    }

    #[test]
    fn test_begin_creates_record() {
        let tracker = TransferTracker::new();
        let range = ByteRange::new(100, 200);
        let slot = tracker.begin("a", 1000, &range, Some(199), "127.0.0.1:5000", 10);
        assert_eq!(RangeSlot(0), slot);

        let record = tracker.snapshot("a").unwrap();
        assert_eq!(10, record.start_time_ns);
        assert_eq!(0, record.end_time_ns);
        assert_eq!(1000, record.file_size);
        assert_eq!("1000 B", record.file_size_human);
        assert_eq!(1, record.ranges.len());

        let range = &record.ranges[0];
        assert_eq!(100, range.start_byte);
        assert_eq!(Some(199), range.end_byte);
        assert_eq!(100, range.requested_len);
        assert_eq!(0, range.returned_bytes);
        assert_eq!("", range.returned_bytes_human);
        assert_eq!("", range.duration);
        assert_eq!("127.0.0.1:5000", range.remote_addr);
    }

    #[test]
    fn test_finalize_fills_range_and_parent() {
        let tracker = TransferTracker::new();
        let slot = tracker.begin("a", 1000, &ByteRange::new(0, 200), Some(199), "x", 1_000);
        let delivered = Delivered {
            returned_bytes: 50,
            end_time_ns: 1_500_000_000 + 1_000,
            client_cancelled: true,
        };
        tracker.finalize("a", slot, delivered);

        let record = tracker.snapshot("a").unwrap();
        let range = &record.ranges[0];
        assert_eq!(50, range.returned_bytes);
        assert_eq!("50 B", range.returned_bytes_human);
        assert_eq!(25.0, range.returned_percent);
        assert!(range.client_cancelled);
        assert_eq!("1.5s", range.duration);
        assert_eq!(1_500_001_000, record.end_time_ns);
        assert_eq!("1.5s", record.duration);
    }

    #[test]
    fn test_first_range_sets_file_size_and_start() {
        let tracker = TransferTracker::new();
        tracker.begin("a", 1000, &ByteRange::new(0, 10), Some(9), "x", 5);
        tracker.begin("a", 4242, &ByteRange::new(10, 20), Some(19), "x", 7);

        let record = tracker.snapshot("a").unwrap();
        assert_eq!(1000, record.file_size);
        assert_eq!(5, record.start_time_ns);
        assert_eq!(vec![0, 10], record.ranges.iter().map(|r| r.start_byte).collect::<Vec<_>>());
    }

    #[test]
    fn test_parent_end_time_does_not_regress() {
        let tracker = TransferTracker::new();
        let first = tracker.begin("a", 100, &ByteRange::new(0, 50), Some(49), "x", 0);
        let second = tracker.begin("a", 100, &ByteRange::new(50, 100), None, "x", 1);

        tracker.finalize("a", second, delivered(50, 3_000));
        tracker.finalize("a", first, delivered(50, 2_000));

        let record = tracker.snapshot("a").unwrap();
        assert_eq!(3_000, record.end_time_ns);
        assert_eq!("3µs", record.duration);
        assert_eq!(2_000, record.ranges[0].end_time_ns);
        assert_eq!(3_000, record.ranges[1].end_time_ns);
    }

    #[test]
    fn test_zero_length_request_has_zero_percent() {
        let tracker = TransferTracker::new();
        let slot = tracker.begin("a", 0, &ByteRange::new(0, 0), None, "x", 0);
        tracker.finalize("a", slot, delivered(0, 1));
        assert_eq!(0.0, tracker.snapshot("a").unwrap().ranges[0].returned_percent);
    }

    #[test]
    fn test_finalize_stale_slot_is_ignored() {
        let tracker = TransferTracker::new();
        tracker.finalize("missing", RangeSlot(0), delivered(1, 1));
        assert_eq!(None, tracker.snapshot("missing"));

        tracker.begin("a", 10, &ByteRange::new(0, 10), None, "x", 0);
        let before = tracker.snapshot("a").unwrap();
        tracker.finalize("a", RangeSlot(7), delivered(1, 1));
        assert_eq!(before, tracker.snapshot("a").unwrap());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let tracker = TransferTracker::new();
        let slot = tracker.begin("a", 10, &ByteRange::new(0, 10), None, "x", 0);
        let snapshot = tracker.snapshot("a").unwrap();
        tracker.finalize("a", slot, delivered(10, 1));
        assert_eq!(0, snapshot.ranges[0].returned_bytes);
        assert_eq!(10, tracker.snapshot("a").unwrap().ranges[0].returned_bytes);
    }

    #[test]
    fn test_concurrent_begin_keeps_every_range() {
        const THREADS: usize = 32;
        let tracker = TransferTracker::new();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let size = 1000 + i as u64;
                    let range = ByteRange::new(0, 1);
                    let slot = tracker.begin("shared", size, &range, Some(0), "x", i as i64 + 1);
                    tracker.finalize("shared", slot, delivered(1, 100));
                    slot
                })
            })
            .collect();

        let slots: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(THREADS, slots.len());

        let record = tracker.snapshot("shared").unwrap();
        assert_eq!(THREADS, record.ranges.len());
        assert!(record.ranges.iter().all(|r| r.returned_bytes == 1));

        // exactly one first arrival won, and its values are consistent
        let winner =
            record.ranges.iter().find(|r| r.start_time_ns == record.start_time_ns).unwrap();
        assert_eq!(1000 + (winner.start_time_ns - 1) as u64, record.file_size);
        assert_eq!(record.ranges[0].start_time_ns, record.start_time_ns);
    }

    #[test]
    fn test_serialized_field_names() {
        let tracker = TransferTracker::new();
        let slot = tracker.begin("a", 1000, &ByteRange::new(100, 200), Some(199), "1.2.3.4:5", 1);
        tracker.finalize("a", slot, delivered(100, 2));
        tracker.begin("a", 1000, &ByteRange::new(0, 1000), None, "1.2.3.4:6", 3);

        let json = serde_json::to_value(tracker.snapshot("a").unwrap()).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        let expected = [
            "time_start_ns",
            "time_end_ns",
            "time_duration",
            "file_size",
            "file_size_human",
            "ranges",
        ];
        for key in expected {
            assert!(keys.contains(&key.to_string()), "missing {key}");
        }

        let first = &json["ranges"][0];
        assert_eq!(100, first["byte_start"]);
        assert_eq!(199, first["byte_end"]);
        assert_eq!(100, first["request_len"]);
        assert_eq!("100 B", first["request_len_human"]);
        assert_eq!(100, first["returned_bytes"]);
        assert_eq!("100 B", first["returned_bytes_human"]);
        assert_eq!(100.0, first["returned_perc"]);
        assert_eq!(1, first["time_start_ns"]);
        assert_eq!(2, first["time_end_ns"]);
        assert_eq!("1ns", first["time_duration"]);
        assert_eq!(false, first["client_cancelled"]);
        assert_eq!("1.2.3.4:5", first["client_addr"]);

        assert_eq!(-1, json["ranges"][1]["byte_end"]);
    }
}
