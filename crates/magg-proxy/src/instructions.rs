//! Instruction aggregation for session handshakes.
//!
//! Concatenates the instruction blocks of every backend a session's filter
//! admits, in `ready_backends` order, so the result is deterministic for a
//! given snapshot. Instructions are fixed at handshake time; existing
//! façades never see later edits.

use crate::aggregate::CapabilitySnapshot;
use crate::filter::TagFilter;

/// Render the merged instruction text for one session, or `None` when no
/// admitted backend carries instructions.
pub fn aggregate_instructions(snapshot: &CapabilitySnapshot, filter: &TagFilter) -> Option<String> {
    let mut sections = Vec::new();
    for name in &snapshot.ready_backends {
        let Some(view) = snapshot.backends.get(name) else {
            continue;
        };
        if !filter.admits(&view.tags) {
            continue;
        }
        if let Some(instructions) = &view.instructions {
            let trimmed = instructions.trim();
            if !trimmed.is_empty() {
                sections.push(format!("## {name}\n\n{trimmed}"));
            }
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::aggregate_instructions;
    use crate::aggregate::{BackendView, CapabilitySnapshot};
    use crate::filter::TagFilter;

    fn snapshot(entries: &[(&str, &[&str], Option<&str>)]) -> CapabilitySnapshot {
        let mut backends = BTreeMap::new();
        let mut ready = Vec::new();
        for (name, tags, instructions) in entries {
            ready.push(name.to_string());
            backends.insert(
                name.to_string(),
                BackendView {
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    instructions: instructions.map(str::to_string),
                },
            );
        }
        ready.sort();
        CapabilitySnapshot {
            ready_backends: ready,
            backends,
            ..Default::default()
        }
    }

    #[test]
    fn concatenates_in_ready_backend_order() {
        let snapshot = snapshot(&[
            ("fs", &["fs"], Some("Use the filesystem.")),
            ("db", &["db"], Some("Query carefully.")),
        ]);
        let text = aggregate_instructions(&snapshot, &TagFilter::None).unwrap();
        assert_eq!(
            text,
            "## db\n\nQuery carefully.\n\n## fs\n\nUse the filesystem."
        );
    }

    #[test]
    fn filter_drops_unadmitted_backends() {
        let snapshot = snapshot(&[
            ("fs", &["fs"], Some("Use the filesystem.")),
            ("db", &["db"], Some("Query carefully.")),
        ]);
        let filter = TagFilter::SimpleOr(vec!["fs".to_string()]);
        let text = aggregate_instructions(&snapshot, &filter).unwrap();
        assert_eq!(text, "## fs\n\nUse the filesystem.");
    }

    #[test]
    fn empty_and_missing_instructions_yield_none() {
        let snapshot = snapshot(&[("fs", &["fs"], None), ("db", &["db"], Some("   "))]);
        assert_eq!(aggregate_instructions(&snapshot, &TagFilter::None), None);
    }

    #[test]
    fn same_snapshot_same_output() {
        let snapshot = snapshot(&[
            ("a", &[], Some("one")),
            ("b", &[], Some("two")),
            ("c", &[], Some("three")),
        ]);
        let first = aggregate_instructions(&snapshot, &TagFilter::None);
        let second = aggregate_instructions(&snapshot, &TagFilter::None);
        assert_eq!(first, second);
    }
}
