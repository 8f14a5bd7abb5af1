use crate::error::StoreError;
use crate::localtime;
use crate::types::{CountEntry, Delivery, DeliveryFilter, DeliveryStats, HourlyBucket, Page};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const LOG_FILE: &str = "deliveries.jsonl";

/// Ordering key: received_at, then id to break ties.
type RecordKey = (DateTime<Utc>, String);

/// Append-only record of received deliveries.
///
/// With a data directory, each insert is appended as one JSON line to
/// `deliveries.jsonl` before it becomes visible; retention rewrites the file.
/// Without one the store lives in memory only.
pub struct WebhookStore {
    inner: RwLock<Records>,
    data_dir: Option<PathBuf>,
}

#[derive(Default)]
struct Records {
    by_time: BTreeMap<RecordKey, Delivery>,
    by_id: HashMap<String, RecordKey>,
    delivery_ids: HashSet<String>,
}

impl Records {
    fn insert(&mut self, delivery: Delivery) {
        let key = (delivery.received_at, delivery.id.clone());
        self.by_id.insert(delivery.id.clone(), key.clone());
        self.delivery_ids.insert(delivery.delivery_id.clone());
        self.by_time.insert(key, delivery);
    }

    fn remove(&mut self, key: &RecordKey) {
        if let Some(d) = self.by_time.remove(key) {
            self.by_id.remove(&d.id);
            self.delivery_ids.remove(&d.delivery_id);
        }
    }

    /// Most recent first.
    fn newest_first(&self) -> impl Iterator<Item = &Delivery> {
        self.by_time.values().rev()
    }
}

impl WebhookStore {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Records::default()),
            data_dir: None,
        }
    }

    /// Open (or create) a store backed by `data_dir`, replaying the existing
    /// log. Malformed lines are skipped with a warning.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut records = Records::default();
        let path = data_dir.join(LOG_FILE);
        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Delivery>(line) {
                    Ok(d) if !records.delivery_ids.contains(&d.delivery_id) => records.insert(d),
                    Ok(d) => {
                        tracing::warn!(delivery_id = %d.delivery_id, "skipping duplicate record in delivery log")
                    }
                    Err(e) => {
                        tracing::warn!(line = lineno + 1, error = %e, "skipping malformed record in delivery log")
                    }
                }
            }
        }
        tracing::info!(path = %path.display(), records = records.by_time.len(), "delivery store loaded");

        Ok(Self {
            inner: RwLock::new(records),
            data_dir: Some(data_dir),
        })
    }

    /// Record a delivery. Fails with `DuplicateKey` if its `delivery_id` is
    /// already stored. The record is visible only once it is durable.
    pub async fn insert(&self, delivery: Delivery) -> Result<String, StoreError> {
        let mut records = self.inner.write().await;
        if records.delivery_ids.contains(&delivery.delivery_id) {
            return Err(StoreError::DuplicateKey(delivery.delivery_id));
        }

        if let Some(dir) = &self.data_dir {
            let mut line = serde_json::to_string(&delivery)
                .map_err(|e| StoreError::StorageUnavailable(e.into()))?;
            line.push('\n');
            append_line(&dir.join(LOG_FILE), &line).await?;
        }

        let id = delivery.id.clone();
        records.insert(delivery);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Delivery, StoreError> {
        let records = self.inner.read().await;
        records
            .by_id
            .get(id)
            .and_then(|key| records.by_time.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    #[cfg(test)]
    pub async fn contains_delivery_id(&self, delivery_id: &str) -> bool {
        self.inner.read().await.delivery_ids.contains(delivery_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_time.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Filtered page, most recent first.
    pub async fn list(&self, filter: &DeliveryFilter, limit: usize, offset: usize) -> Page<Delivery> {
        let records = self.inner.read().await;
        let mut total = 0;
        let mut items = Vec::new();
        for d in records.newest_first().filter(|d| filter.matches(d)) {
            if total >= offset && items.len() < limit {
                items.push(d.clone());
            }
            total += 1;
        }
        Page { items, total, limit, offset }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Vec<Delivery> {
        let filter = DeliveryFilter {
            search: Some(query.to_string()),
            ..Default::default()
        };
        self.list(&filter, limit, 0).await.items
    }

    /// Aggregate counters. "Today" and the hourly buckets follow `tz`.
    pub async fn stats(&self, tz: Tz, now: DateTime<Utc>) -> DeliveryStats {
        let records = self.inner.read().await;

        let current_hour = localtime::local_hour_start(now, tz);
        let window_start = current_hour - Duration::hours(23);
        let mut hourly: Vec<HourlyBucket> = (0..24)
            .map(|i| {
                let start = window_start + Duration::hours(i);
                HourlyBucket {
                    hour: localtime::to_local(start, tz).format("%H:00").to_string(),
                    start,
                    count: 0,
                }
            })
            .collect();

        let mut today = 0;
        let mut valid = 0;
        let mut processing_total: u64 = 0;
        let mut by_event: HashMap<&str, usize> = HashMap::new();
        let mut by_company: HashMap<&str, usize> = HashMap::new();

        for d in records.by_time.values() {
            if localtime::same_local_day(d.received_at, now, tz) {
                today += 1;
            }
            if d.is_valid_signature {
                valid += 1;
            }
            processing_total += d.processing_time_ms;
            *by_event.entry(d.event_type.as_str()).or_default() += 1;
            if let Some(company) = d.company_id.as_deref() {
                *by_company.entry(company).or_default() += 1;
            }
            if d.received_at >= window_start && d.received_at < current_hour + Duration::hours(1) {
                let idx = (d.received_at - window_start).num_hours() as usize;
                if let Some(bucket) = hourly.get_mut(idx) {
                    bucket.count += 1;
                }
            }
        }

        let total = records.by_time.len();
        DeliveryStats {
            total_webhooks: total,
            today_webhooks: today,
            valid_signatures: valid,
            invalid_signatures: total - valid,
            event_types: ranked(by_event),
            companies: ranked(by_company),
            hourly,
            avg_processing_time_ms: if total == 0 {
                0.0
            } else {
                processing_total as f64 / total as f64
            },
            timezone: tz.name().to_string(),
        }
    }

    /// Delete deliveries older than `retention_days`, then everything beyond
    /// the `keep_count` most recent. Zero disables the respective limit.
    /// Ids in `in_flight` are never deleted.
    pub async fn delete_older_than_or_beyond_count(
        &self,
        retention_days: u32,
        keep_count: usize,
        in_flight: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut records = self.inner.write().await;
        let cutoff = (retention_days > 0).then(|| now - Duration::days(retention_days as i64));

        let doomed: Vec<RecordKey> = records
            .newest_first()
            .enumerate()
            .filter(|(rank, d)| {
                let too_old = cutoff.is_some_and(|c| d.received_at < c);
                let beyond = keep_count > 0 && *rank >= keep_count;
                (too_old || beyond) && !in_flight.contains(&d.id)
            })
            .map(|(_, d)| (d.received_at, d.id.clone()))
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let mut remaining = Records::default();
        let doomed_set: HashSet<&RecordKey> = doomed.iter().collect();
        for (key, d) in &records.by_time {
            if !doomed_set.contains(key) {
                remaining.insert(d.clone());
            }
        }

        if let Some(dir) = &self.data_dir {
            rewrite_log(dir, remaining.by_time.values()).await?;
        }

        for key in &doomed {
            records.remove(key);
        }
        Ok(doomed.len())
    }
}

fn ranked(counts: HashMap<&str, usize>) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = counts
        .into_iter()
        .map(|(key, count)| CountEntry { key: key.to_string(), count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries
}

async fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn rewrite_log<'a>(
    dir: &Path,
    deliveries: impl Iterator<Item = &'a Delivery>,
) -> Result<(), StoreError> {
    let mut content = String::new();
    for d in deliveries {
        let line = serde_json::to_string(d).map_err(|e| StoreError::StorageUnavailable(e.into()))?;
        content.push_str(&line);
        content.push('\n');
    }
    let tmp = dir.join(format!("{LOG_FILE}.tmp"));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, dir.join(LOG_FILE)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TZ: Tz = chrono_tz::Africa::Douala;

    fn delivery(n: usize, received_at: DateTime<Utc>) -> Delivery {
        Delivery {
            id: format!("id-{n}"),
            delivery_id: format!("delivery-{n}"),
            event_type: if n % 2 == 0 { "order.created" } else { "payment.completed" }.into(),
            company_id: (n % 3 == 0).then(|| "acme".to_string()),
            payload: format!(r#"{{"n":{n}}}"#),
            payload_base64: None,
            headers: vec![("content-type".into(), "application/json".into())],
            signature: None,
            is_valid_signature: n % 4 != 0,
            signature_error: None,
            source_ip: Some("127.0.0.1".into()),
            user_agent: None,
            received_at,
            processing_time_ms: n as u64,
        }
    }

    async fn seeded(count: usize, now: DateTime<Utc>) -> WebhookStore {
        let store = WebhookStore::in_memory();
        for n in 0..count {
            store
                .insert(delivery(n, now - Duration::minutes(n as i64)))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn duplicate_delivery_id_is_rejected() {
        let store = WebhookStore::in_memory();
        let now = Utc::now();
        store.insert(delivery(1, now)).await.unwrap();

        let mut dup = delivery(1, now);
        dup.id = "other".into();
        let err = store.insert(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(id) if id == "delivery-1"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn get_by_id_and_not_found() {
        let store = seeded(3, Utc::now()).await;
        assert_eq!(store.get("id-2").await.unwrap().delivery_id, "delivery-2");
        assert!(matches!(store.get("missing").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let now = Utc::now();
        let store = WebhookStore::in_memory();
        // Insert out of order
        for n in [3usize, 0, 2, 1] {
            store.insert(delivery(n, now - Duration::minutes(n as i64))).await.unwrap();
        }
        let page = store.list(&DeliveryFilter::default(), 10, 0).await;
        let times: Vec<_> = page.items.iter().map(|d| d.received_at).collect();
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(page.items[0].id, "id-0");
    }

    #[tokio::test]
    async fn pages_cover_total_exactly() {
        let store = seeded(23, Utc::now()).await;
        let filter = DeliveryFilter {
            event_type: Some("order.created".into()),
            ..Default::default()
        };
        let mut offset = 0;
        let mut seen = 0;
        loop {
            let page = store.list(&filter, 5, offset).await;
            seen += page.items.len();
            if !page.has_more() {
                assert_eq!(seen, page.total);
                break;
            }
            offset += 5;
        }
        assert_eq!(seen, 12);
    }

    #[tokio::test]
    async fn stats_invariants() {
        let now = Utc::now();
        let store = seeded(10, now).await;
        let stats = store.stats(TZ, now).await;
        assert_eq!(stats.total_webhooks, 10);
        assert_eq!(stats.valid_signatures + stats.invalid_signatures, stats.total_webhooks);
        assert_eq!(stats.invalid_signatures, 3); // n = 0, 4, 8
        assert_eq!(stats.hourly.len(), 24);
        assert_eq!(stats.hourly.iter().map(|b| b.count).sum::<usize>(), 10);
        assert_eq!(stats.event_types[0].count, 5);
        assert_eq!(stats.companies, vec![CountEntry { key: "acme".into(), count: 4 }]);
        assert_eq!(stats.timezone, "Africa/Douala");
    }

    #[tokio::test]
    async fn today_uses_display_timezone() {
        // 23:30 UTC on the 10th is 00:30 on the 11th in Douala.
        let now = DateTime::parse_from_rfc3339("2024-03-11T00:40:00+01:00").unwrap().with_timezone(&Utc);
        let store = WebhookStore::in_memory();
        let late = DateTime::parse_from_rfc3339("2024-03-10T23:30:00Z").unwrap().with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2024-03-10T22:30:00Z").unwrap().with_timezone(&Utc);
        store.insert(delivery(1, late)).await.unwrap();
        store.insert(delivery(2, earlier)).await.unwrap();

        assert_eq!(store.stats(TZ, now).await.today_webhooks, 1);
        assert_eq!(store.stats(chrono_tz::UTC, now).await.today_webhooks, 2);
    }

    #[tokio::test]
    async fn retention_by_age_and_count() {
        let now = Utc::now();
        let store = WebhookStore::in_memory();
        for n in 0..5 {
            let age = Duration::days(n as i64 * 10) + Duration::hours(1);
            store.insert(delivery(n, now - age)).await.unwrap();
        }
        // 30 days: drops n=3 and n=4
        let deleted = store
            .delete_older_than_or_beyond_count(30, 0, &HashSet::new(), now)
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let deleted = store
            .delete_older_than_or_beyond_count(0, 1, &HashSet::new(), now)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get("id-0").await.unwrap().id, "id-0");
        assert!(!store.contains_delivery_id("delivery-1").await);
    }

    #[tokio::test]
    async fn retention_spares_in_flight_records() {
        let now = Utc::now();
        let store = seeded(4, now).await;
        let in_flight: HashSet<String> = ["id-3".to_string()].into_iter().collect();
        let deleted = store
            .delete_older_than_or_beyond_count(0, 1, &in_flight, now)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("id-3").await.is_ok());
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        {
            let store = WebhookStore::open(dir.path()).await.unwrap();
            for n in 0..3 {
                store.insert(delivery(n, now - Duration::days(n as i64 * 40))).await.unwrap();
            }
            store
                .delete_older_than_or_beyond_count(30, 0, &HashSet::new(), now)
                .await
                .unwrap();
        }
        let reopened = WebhookStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        let d = reopened.get("id-0").await.unwrap();
        assert_eq!(d.payload, r#"{"n":0}"#);
        assert_eq!(d.headers, vec![("content-type".to_string(), "application/json".to_string())]);
    }

    #[tokio::test]
    async fn reload_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let good = serde_json::to_string(&delivery(1, Utc::now())).unwrap();
        std::fs::write(dir.path().join(LOG_FILE), format!("{good}\nnot json\n\n")).unwrap();
        let store = WebhookStore::open(dir.path()).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unwritable_log_is_storage_unavailable() {
        let dir = tempdir().unwrap();
        let store = WebhookStore::open(dir.path()).await.unwrap();
        // Replace the log path with a directory so appends fail.
        std::fs::create_dir(dir.path().join(LOG_FILE)).unwrap();
        let err = store.insert(delivery(1, Utc::now())).await.unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
        assert!(store.is_empty().await);
    }
}
