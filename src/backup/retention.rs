// Retention Selection - which backups a sweep removes

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

use super::types::{BackupRecord, RetentionPolicy, RetentionStrategy};

/// Group records by source file, oldest first within each group
pub fn group_by_source<'a>(
    records: impl IntoIterator<Item = &'a BackupRecord>,
) -> BTreeMap<PathBuf, Vec<&'a BackupRecord>> {
    let mut groups: BTreeMap<PathBuf, Vec<&BackupRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.source_path.clone()).or_default().push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
    groups
}

/// Ids to remove from one source file's backups
///
/// The union of the oldest entries beyond `max_count` and every entry older than
/// `now - max_age`, without duplicates, in removal order.
pub fn select_for_removal(
    group: &[&BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    if policy.strategy != RetentionStrategy::Simple {
        warn!(strategy = ?policy.strategy, "Retention strategy not implemented, using simple selection");
    }

    let mut ordered: Vec<&BackupRecord> = group.to_vec();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut seen = HashSet::new();
    let mut removal = Vec::new();

    let excess = ordered.len().saturating_sub(policy.max_count);
    for record in ordered.iter().take(excess) {
        if seen.insert(record.id.as_str()) {
            removal.push(record.id.clone());
        }
    }

    let cutoff = chrono::Duration::from_std(policy.max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age));
    if let Some(cutoff) = cutoff {
        for record in &ordered {
            if record.created_at < cutoff && seen.insert(record.id.as_str()) {
                removal.push(record.id.clone());
            }
        }
    }

    removal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::{BackupKind, BackupReason, BackupStatus};
    use proptest::prelude::*;
    use std::time::Duration;

    fn record(id: usize, age_secs: i64, now: DateTime<Utc>) -> BackupRecord {
        BackupRecord {
            id: format!("backup-{:016x}", id),
            source_path: PathBuf::from("/p/state.json"),
            backup_path: PathBuf::from(format!("/p/.backups/{}.backup", id)),
            kind: BackupKind::Automatic,
            reason: BackupReason::Scheduled,
            status: BackupStatus::Completed,
            created_at: now - chrono::Duration::seconds(age_secs),
            completed_at: None,
            duration_ms: 1,
            source_size: 1,
            backup_size: 1,
            source_checksum: "x".into(),
            backup_checksum: "x".into(),
            compressed: false,
            integrity_checked: false,
            tags: Vec::new(),
            created_by: "test".into(),
            version: "1.0".into(),
        }
    }

    #[test]
    fn test_count_limit_removes_oldest() {
        let now = Utc::now();
        let records: Vec<_> = (0..12).map(|i| record(i, 1000 - i as i64, now)).collect();
        let group: Vec<&BackupRecord> = records.iter().collect();

        let removal = select_for_removal(&group, &RetentionPolicy::new().max_count(10), now);
        assert_eq!(removal, vec![records[0].id.clone(), records[1].id.clone()]);
    }

    #[test]
    fn test_age_and_count_union_without_duplicates() {
        let now = Utc::now();
        let records = vec![record(1, 500, now), record(2, 400, now), record(3, 10, now)];
        let group: Vec<&BackupRecord> = records.iter().collect();
        let policy = RetentionPolicy::new()
            .max_count(2)
            .max_age(Duration::from_secs(300));

        let removal = select_for_removal(&group, &policy, now);
        assert_eq!(removal.len(), 2);
        assert!(removal.contains(&records[0].id));
        assert!(removal.contains(&records[1].id));
    }

    #[test]
    fn test_groups_are_keyed_by_source() {
        let now = Utc::now();
        let mut other = record(9, 1, now);
        other.source_path = PathBuf::from("/p/other.json");
        let records = vec![record(1, 5, now), other, record(2, 3, now)];

        let groups = group_by_source(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&PathBuf::from("/p/state.json")].len(), 2);
    }

    proptest! {
        #[test]
        fn prop_survivors_respect_policy(
            ages in proptest::collection::vec(0i64..10_000, 0..40),
            max_count in 1usize..15,
            max_age in 1u64..10_000,
        ) {
            let now = Utc::now();
            let records: Vec<_> = ages.iter().enumerate().map(|(i, age)| record(i, *age, now)).collect();
            let group: Vec<&BackupRecord> = records.iter().collect();
            let policy = RetentionPolicy::new().max_count(max_count).max_age(Duration::from_secs(max_age));

            let removal: HashSet<String> = select_for_removal(&group, &policy, now).into_iter().collect();
            let survivors: Vec<_> = records.iter().filter(|r| !removal.contains(&r.id)).collect();

            prop_assert!(survivors.len() <= max_count);
            let cutoff = now - chrono::Duration::seconds(max_age as i64);
            prop_assert!(survivors.iter().all(|r| r.created_at >= cutoff));
        }
    }
}
