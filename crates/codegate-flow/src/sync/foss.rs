//! Curation of open-source-scan fragments.
//!
//! FossScan defects are not stored as ordinary defect rows. Their scan
//! matches are filtered and sorted, split into path components, and written
//! as [`FossFragment`] records keyed by issue key, with reviewer-curated
//! metadata copied forward across re-scans.

use std::sync::Arc;

use codegate_core::id::TaskId;

use crate::error::Result;
use crate::model::{DefectRecord, FossFragment, FossScanEntry};
use crate::store::FragmentStore;

/// Hit spans at or below this many lines are noise and are dropped.
pub const MIN_HIT_SPAN_LINES: u32 = 10;

/// Builds a fragment from a FossScan defect.
///
/// Returns `None` when every scan entry is filtered away; such defects
/// produce no fragment at all.
pub(crate) fn build_fragment(defect: &DefectRecord) -> Option<FossFragment> {
    let scan_results: Vec<FossScanEntry> = defect
        .scan_results
        .iter()
        .filter_map(|entry| {
            let mut hits: Vec<_> = entry
                .hits
                .iter()
                .filter(|hit| hit.span() > MIN_HIT_SPAN_LINES)
                .cloned()
                .collect();
            if hits.is_empty() {
                return None;
            }
            hits.sort_by_key(|hit| hit.hit_start_line);
            Some(FossScanEntry {
                source_file: entry.source_file.clone(),
                hits,
            })
        })
        .collect();

    if scan_results.is_empty() {
        return None;
    }

    let (path, file_name) = split_path(&defect.file_path);
    let suffix = file_name
        .rsplit_once('.')
        .map(|(_, suffix)| suffix.to_string());

    Some(FossFragment {
        issue_key: defect.issue_key.clone(),
        task_id: defect.task_id.clone(),
        event_id: defect.event_id.clone(),
        defect_id: defect.defect_id.clone(),
        path,
        file_name,
        suffix,
        confirmed: defect.status != "0",
        scan_results,
        confirm_time: None,
        component_name: None,
        component_version: None,
        foss_type: None,
        remarks: None,
        open: None,
        owner_id: None,
        owner_name: None,
    })
}

/// Stores curated fragments for a task, replacing the previous set.
///
/// Curated fields are copied forward from any pre-existing fragment with
/// the same issue key before the replace, so reviewer work survives the
/// re-scan. Returns the number of fragments stored.
pub(crate) async fn store_fragments(
    store: &Arc<dyn FragmentStore>,
    task_id: &TaskId,
    foss_defects: &[DefectRecord],
) -> Result<u64> {
    let mut fragments = Vec::new();
    for defect in foss_defects {
        let Some(mut fragment) = build_fragment(defect) else {
            continue;
        };
        if let Some(previous) = store.fragment(&fragment.issue_key).await? {
            fragment.carry_curated_fields(&previous);
        }
        fragments.push(fragment);
    }

    let stored = fragments.len() as u64;
    store.replace_for_task(task_id, fragments).await?;
    Ok(stored)
}

fn split_path(file_path: &str) -> (String, String) {
    match file_path.rsplit_once('/') {
        Some((path, name)) => (path.to_string(), name.to_string()),
        None => (String::new(), file_path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use codegate_core::id::EventId;

    use crate::model::FossHit;
    use crate::store::memory::InMemoryStores;

    fn hit(start: u32, end: u32) -> FossHit {
        FossHit {
            hit_start_line: start,
            hit_end_line: end,
        }
    }

    fn foss_defect(issue_key: &str, scan_results: Vec<FossScanEntry>) -> DefectRecord {
        DefectRecord {
            task_id: TaskId::new("t1"),
            event_id: EventId::new("e1"),
            file_path: "src/vendor/zlib.rs".into(),
            line: 1,
            rule_name: "foss-match".into(),
            severity: "serious".into(),
            status: "0".into(),
            issue_key: issue_key.into(),
            defect_id: "77".into(),
            checker: "FossScanChecker".into(),
            fragment: None,
            scan_results,
        }
    }

    #[test]
    fn short_spans_are_filtered_and_hits_sorted() {
        let defect = foss_defect(
            "ik-1",
            vec![FossScanEntry {
                source_file: "zlib/inflate.c".into(),
                hits: vec![hit(100, 160), hit(5, 12), hit(10, 50)],
            }],
        );

        let fragment = build_fragment(&defect).unwrap();
        assert_eq!(fragment.scan_results.len(), 1);
        let hits = &fragment.scan_results[0].hits;
        // The 7-line span is gone, the rest are ordered by start line.
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].hit_start_line, 10);
        assert_eq!(hits[1].hit_start_line, 100);
    }

    #[test]
    fn zero_hit_entries_and_fragments_are_dropped() {
        let defect = foss_defect(
            "ik-1",
            vec![FossScanEntry {
                source_file: "zlib/inflate.c".into(),
                hits: vec![hit(1, 4), hit(20, 25)],
            }],
        );
        assert!(build_fragment(&defect).is_none());
    }

    #[test]
    fn path_components_are_split() {
        let defect = foss_defect(
            "ik-1",
            vec![FossScanEntry {
                source_file: "zlib/inflate.c".into(),
                hits: vec![hit(1, 100)],
            }],
        );

        let fragment = build_fragment(&defect).unwrap();
        assert_eq!(fragment.path, "src/vendor");
        assert_eq!(fragment.file_name, "zlib.rs");
        assert_eq!(fragment.suffix.as_deref(), Some("rs"));
    }

    #[tokio::test]
    async fn curated_fields_survive_rescan() {
        let stores = Arc::new(InMemoryStores::new());
        let store: Arc<dyn FragmentStore> = stores;
        let task_id = TaskId::new("t1");

        let scan = vec![FossScanEntry {
            source_file: "zlib/inflate.c".into(),
            hits: vec![hit(1, 100)],
        }];
        store_fragments(&store, &task_id, &[foss_defect("ik-1", scan.clone())])
            .await
            .unwrap();

        // A reviewer fills in component metadata.
        let mut reviewed = store.fragment("ik-1").await.unwrap().unwrap();
        reviewed.component_name = Some("zlib".into());
        reviewed.open = Some(true);
        store
            .replace_for_task(&task_id, vec![reviewed])
            .await
            .unwrap();

        // Re-scan produces the same issue key again.
        let stored = store_fragments(&store, &task_id, &[foss_defect("ik-1", scan)])
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let fragment = store.fragment("ik-1").await.unwrap().unwrap();
        assert_eq!(fragment.component_name.as_deref(), Some("zlib"));
        assert_eq!(fragment.open, Some(true));
    }
}
