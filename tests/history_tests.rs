//! TransferHistory unit tests

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;
    use world_mesh::history::{TransferHistory, HISTORY_CAP};
    use world_mesh::types::TransferRecord;

    fn make_record(n: u64, source: &str, dest: &str, success: bool) -> TransferRecord {
        TransferRecord {
            transfer_id: format!("t-{}", n),
            timestamp: "2026-08-01T00:00:00Z".to_string(),
            entity_type: "fish".to_string(),
            entity_old_id: format!("e{}", n),
            entity_new_id: success.then(|| format!("e{}", n + 1000)),
            source_world_id: source.to_string(),
            source_world_name: source.to_string(),
            dest_world_id: dest.to_string(),
            dest_world_name: dest.to_string(),
            success,
            error: (!success).then(|| "deserialize failed".to_string()),
            generation: None,
            selection_seed: Some(n),
        }
    }

    // -----------------------------------------------------------------------
    // Ring semantics
    // -----------------------------------------------------------------------

    #[test]
    fn ring_is_bounded_at_cap() {
        let dir = tempdir().unwrap();
        let history = TransferHistory::new(dir.path().join("transfers.log"));
        for n in 0..(HISTORY_CAP as u64 + 20) {
            history.log(make_record(n, "A", "B", true));
        }
        assert_eq!(history.len(), HISTORY_CAP);

        // The oldest records fell off the front.
        assert!(history.get("t-0").is_none());
        assert!(history.get("t-119").is_some());
    }

    #[test]
    fn query_is_most_recent_first_with_filters() {
        let dir = tempdir().unwrap();
        let history = TransferHistory::new(dir.path().join("transfers.log"));
        history.log(make_record(1, "A", "B", true));
        history.log(make_record(2, "B", "C", false));
        history.log(make_record(3, "A", "C", true));

        let all = history.query(50, None, false);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].transfer_id, "t-3");

        let for_a = history.query(50, Some("A"), false);
        assert_eq!(for_a.len(), 2);

        // World id matches source or destination.
        let for_c = history.query(50, Some("C"), false);
        assert_eq!(for_c.len(), 2);

        let successes = history.query(50, None, true);
        assert_eq!(successes.len(), 2);

        let limited = history.query(1, None, false);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].transfer_id, "t-3");
    }

    // -----------------------------------------------------------------------
    // Rehydration
    // -----------------------------------------------------------------------

    #[test]
    fn rehydrates_from_file_skipping_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfers.log");

        {
            let history = TransferHistory::new(&path);
            history.log(make_record(1, "A", "B", true));
            history.log(make_record(2, "A", "B", false));
        }
        // A torn write in the middle of the file.
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        {
            let history = TransferHistory::new(&path);
            history.log(make_record(3, "A", "B", true));
        }

        let reloaded = TransferHistory::new(&path);
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.get("t-1").is_some());
        assert!(reloaded.get("t-3").is_some());
    }

    // -----------------------------------------------------------------------
    // Flow counters
    // -----------------------------------------------------------------------

    #[test]
    fn migration_counts_accumulate_and_reset() {
        let dir = tempdir().unwrap();
        let history = TransferHistory::new(dir.path().join("transfers.log"));
        history.log(make_record(1, "A", "B", true));
        history.log(make_record(2, "A", "B", true));
        history.log(make_record(3, "B", "A", true));
        // Failures do not count as flow.
        history.log(make_record(4, "A", "B", false));

        let (in_a, out_a) = history.take_migration_counts("A");
        assert_eq!(in_a, 1);
        assert_eq!(out_a, 2);

        // Reset on read.
        let (in_a, out_a) = history.take_migration_counts("A");
        assert_eq!(in_a, 0);
        assert_eq!(out_a, 0);
    }

    #[test]
    fn world_stats_count_successes_and_failures() {
        let dir = tempdir().unwrap();
        let history = TransferHistory::new(dir.path().join("transfers.log"));
        history.log(make_record(1, "A", "B", true));
        history.log(make_record(2, "C", "A", false));

        let stats = history.world_stats("A");
        assert_eq!(stats.transfers_out, 1);
        assert_eq!(stats.transfers_out_success, 1);
        assert_eq!(stats.transfers_in, 1);
        assert_eq!(stats.transfers_in_failed, 1);
    }
}
