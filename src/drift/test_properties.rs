//! Property-based tests for change-set and queue invariants.
//!
//! Arbitrary snapshot pairs are diffed, encoded and decoded; arbitrary
//! schedule sets are drained from the queue.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use crate::drift::changeset::{Category, ChangeType, Header};
use crate::drift::codec::{ChangeSetReader, write_change_set};
use crate::drift::definition::{BaseDirectory, DriftDefinition, DriftDetectionSchedule};
use crate::drift::queue::ScheduleQueue;
use crate::scanner::analyzer::{Snapshot, diff};
use crate::scanner::digest::digest;

// ──────────────────── strategies ────────────────────

fn arb_path() -> impl Strategy<Value = String> {
    "[a-c]{1,2}(/[a-c]{1,2}){0,2}\\.(conf|xml)"
}

fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
    prop::collection::btree_map(arb_path(), 0u8..4, 0..12).prop_map(|files| {
        files
            .into_iter()
            .map(|(path, content)| (path, digest(&[content])))
            .collect()
    })
}

fn header(category: Category) -> Header {
    Header {
        definition_name: "prop".to_string(),
        basedir_path: "/srv".to_string(),
        category,
        version: 3,
    }
}

fn arb_schedule_plan() -> impl Strategy<Value = Vec<(bool, i64)>> {
    prop::collection::vec((any::<bool>(), 0i64..5), 0..20)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Whatever the diff, the encoded change-set decodes to the same
    /// entries, and no directory record is empty.
    #[test]
    fn diff_survives_encoding(current in arb_snapshot(), baseline in arb_snapshot(), first in any::<bool>()) {
        let result = diff(&current, (!first).then_some(&baseline));
        let entries = result.directory_entries();
        prop_assert!(entries.iter().all(|d| !d.files.is_empty()));

        let bytes = write_change_set(Vec::new(), &header(result.category), &entries).unwrap();
        let (decoded_header, decoded) = ChangeSetReader::new(&bytes[..]).unwrap().read_all().unwrap();
        prop_assert_eq!(decoded_header.category, result.category);
        prop_assert_eq!(decoded, entries);
    }

    /// Directory records come out sorted by directory, files by name.
    #[test]
    fn entries_are_sorted(current in arb_snapshot(), baseline in arb_snapshot()) {
        let entries = diff(&current, Some(&baseline)).directory_entries();
        prop_assert!(entries.windows(2).all(|w| w[0].directory < w[1].directory));
        for dir in &entries {
            prop_assert!(dir.files.windows(2).all(|w| w[0].file_name < w[1].file_name));
        }
    }

    /// Applying a drift change-set to its baseline reproduces the scan.
    #[test]
    fn applying_drift_reaches_current(current in arb_snapshot(), baseline in arb_snapshot()) {
        let result = diff(&current, Some(&baseline));
        let mut folded = baseline.clone();
        folded.apply(&result.directory_entries());
        prop_assert_eq!(folded, current);
    }

    /// A first scan is COVERAGE and every entry is ADDED.
    #[test]
    fn first_scan_is_all_added(current in arb_snapshot()) {
        let result = diff(&current, None);
        prop_assert_eq!(result.category, Category::Coverage);
        prop_assert_eq!(result.added.len(), current.len());
        prop_assert!(result
            .directory_entries()
            .iter()
            .flat_map(|d| &d.files)
            .all(|f| f.change_type == ChangeType::Added));
    }

    /// Draining the queue yields enabled schedules by next scan (FIFO on
    /// ties) followed by disabled ones.
    #[test]
    fn queue_drains_in_priority_order(plans in arb_schedule_plan()) {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut queue = ScheduleQueue::new();
        for (i, (enabled, offset)) in plans.iter().enumerate() {
            let mut def = DriftDefinition::new(
                format!("d{i}"),
                BaseDirectory::file_system("/srv"),
                Duration::from_secs(60),
            );
            def.enabled = *enabled;
            let due = base + chrono::Duration::seconds(*offset);
            prop_assert!(queue.enqueue(DriftDetectionSchedule::due_at(1, def, due)));
        }

        let mut expected: Vec<(bool, i64, usize)> = plans
            .iter()
            .enumerate()
            .map(|(i, (enabled, offset))| (!enabled, *offset, i))
            .collect();
        expected.sort_unstable();

        let mut drained = Vec::new();
        while let Some(schedule) = queue.get_next_schedule() {
            drained.push(schedule.definition.name.clone());
        }
        let expected: Vec<String> = expected.iter().map(|(_, _, i)| format!("d{i}")).collect();
        prop_assert_eq!(drained, expected);
        prop_assert_eq!(queue.active_count(), plans.len());
    }

    /// Grouping never loses or invents files.
    #[test]
    fn grouping_preserves_file_count(current in arb_snapshot(), baseline in arb_snapshot()) {
        let result = diff(&current, Some(&baseline));
        let grouped: usize = result.directory_entries().iter().map(|d| d.files.len()).sum();
        prop_assert_eq!(grouped, result.total());
        let paths: BTreeMap<String, ChangeType> = result
            .directory_entries()
            .iter()
            .flat_map(|d| d.files.iter().map(|f| (d.file_path(&f.file_name), f.change_type)))
            .collect();
        prop_assert_eq!(paths.len(), result.total());
    }
}
