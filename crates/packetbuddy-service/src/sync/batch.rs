//! A batch of samples grouped for one remote round-trip.

use std::collections::BTreeMap;

use packetbuddy_store::keys::month_key;
use packetbuddy_store::{UsageSample, UsageTotals};
use time::{Date, UtcOffset};
use uuid::Uuid;

/// Samples plus their per-device daily and monthly sums.
///
/// The aggregate maps let the replica do one upsert per bucket instead of
/// one per sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    /// Identifier recorded by the replica to detect re-application.
    pub batch_id: Uuid,
    /// Raw samples, oldest first.
    pub samples: Vec<UsageSample>,
    /// Sums keyed by `(device_id, day)`.
    pub daily: BTreeMap<(String, Date), UsageTotals>,
    /// Sums keyed by `(device_id, "YYYY-MM")`.
    pub monthly: BTreeMap<(String, String), UsageTotals>,
}

impl SyncBatch {
    /// Group `samples` into day and month buckets using `offset`.
    ///
    /// `offset` must match the local store's bucketing offset so remote
    /// aggregates agree with local ones.
    pub fn build(batch_id: Uuid, samples: Vec<UsageSample>, offset: UtcOffset) -> Self {
        let mut daily: BTreeMap<(String, Date), UsageTotals> = BTreeMap::new();
        let mut monthly: BTreeMap<(String, String), UsageTotals> = BTreeMap::new();

        for sample in &samples {
            let date = sample.timestamp.to_offset(offset).date();
            daily
                .entry((sample.device_id.clone(), date))
                .or_default()
                .add(sample.bytes_sent, sample.bytes_received);
            monthly
                .entry((sample.device_id.clone(), month_key(date)))
                .or_default()
                .add(sample.bytes_sent, sample.bytes_received);
        }

        Self {
            batch_id,
            samples,
            daily,
            monthly,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Local row IDs of every sample.
    pub fn ids(&self) -> Vec<i64> {
        self.samples.iter().map(|s| s.id).collect()
    }

    /// Highest local row ID.
    pub fn max_id(&self) -> Option<i64> {
        self.samples.iter().map(|s| s.id).max()
    }

    /// Total bytes in the batch.
    pub fn totals(&self) -> UsageTotals {
        self.daily
            .values()
            .fold(UsageTotals::default(), |mut acc, t| {
                acc.add(t.bytes_sent, t.bytes_received);
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime, offset};
    use time::OffsetDateTime;

    use super::*;

    fn sample(id: i64, device: &str, timestamp: OffsetDateTime, sent: u64, recv: u64) -> UsageSample {
        UsageSample {
            id,
            device_id: device.to_string(),
            timestamp,
            bytes_sent: sent,
            bytes_received: recv,
            synced: false,
        }
    }

    #[test]
    fn test_build_groups_by_day_and_month() {
        let samples = vec![
            sample(1, "d", datetime!(2025-06-01 08:00 UTC), 100, 200),
            sample(2, "d", datetime!(2025-06-01 20:00 UTC), 10, 20),
            sample(3, "d", datetime!(2025-06-02 09:00 UTC), 1, 2),
        ];
        let batch = SyncBatch::build(Uuid::new_v4(), samples, UtcOffset::UTC);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.daily.len(), 2);
        assert_eq!(
            batch.daily[&("d".to_string(), date!(2025 - 06 - 01))],
            UsageTotals::new(110, 220)
        );
        assert_eq!(
            batch.daily[&("d".to_string(), date!(2025 - 06 - 02))],
            UsageTotals::new(1, 2)
        );
        assert_eq!(batch.monthly.len(), 1);
        assert_eq!(
            batch.monthly[&("d".to_string(), "2025-06".to_string())],
            UsageTotals::new(111, 222)
        );
        assert_eq!(batch.ids(), vec![1, 2, 3]);
        assert_eq!(batch.max_id(), Some(3));
        assert_eq!(batch.totals(), UsageTotals::new(111, 222));
    }

    #[test]
    fn test_build_uses_offset_for_buckets() {
        // 23:30 UTC on May 31st is already June 1st two hours east.
        let samples = vec![sample(7, "d", datetime!(2025-05-31 23:30 UTC), 5, 5)];
        let batch = SyncBatch::build(Uuid::new_v4(), samples, offset!(+2));

        assert!(batch.daily.contains_key(&("d".to_string(), date!(2025 - 06 - 01))));
        assert!(batch.monthly.contains_key(&("d".to_string(), "2025-06".to_string())));
    }

    #[test]
    fn test_empty_batch() {
        let batch = SyncBatch::build(Uuid::new_v4(), Vec::new(), UtcOffset::UTC);
        assert!(batch.is_empty());
        assert_eq!(batch.max_id(), None);
        assert_eq!(batch.totals(), UsageTotals::default());
    }
}
