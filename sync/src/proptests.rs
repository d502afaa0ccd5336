#[cfg(test)]
mod proptests {
    use crate::conflict::{self, ConflictPolicy, ConflictType};
    use ct_core::types::{EntityTable, OperationType};
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    // Small field universe mixing critical, mergeable and unclassified
    // delivery fields.
    const FIELDS: [&str; 6] = [
        "weight_kg",
        "price_per_kg",
        "notes",
        "quality_grade",
        "quantity_bags",
        "collector",
    ];

    fn object(values: &[(usize, i64)]) -> Value {
        let mut map = Map::new();
        for (index, value) in values {
            map.insert(FIELDS[*index].to_string(), Value::from(*value));
        }
        Value::Object(map)
    }

    fn subset() -> impl Strategy<Value = Vec<(usize, i64)>> {
        prop::collection::vec((0usize..FIELDS.len(), 0i64..4), 0..FIELDS.len()).prop_map(|mut v| {
            v.sort_by_key(|(i, _)| *i);
            v.dedup_by_key(|(i, _)| *i);
            v
        })
    }

    proptest! {
        // Classification is critical iff the overlap touches a critical
        // field, non-critical iff the overlap is non-empty otherwise,
        // none iff empty.
        #[test]
        fn test_classification_matches_overlap(
            base_fields in subset(),
            remote_fields in subset(),
            local_fields in subset(),
        ) {
            let policy = ConflictPolicy::default();
            let base = object(&base_fields);
            let remote = object(&remote_fields);
            let local = object(&local_fields);

            let detection = conflict::detect(
                &policy,
                EntityTable::Deliveries,
                OperationType::Update,
                Some(&base),
                &remote,
                &local,
            );

            let remote_changed: Vec<&str> = FIELDS
                .iter()
                .copied()
                .filter(|f| base.get(f) != remote.get(f))
                .collect();
            let overlap: Vec<&str> = remote_changed
                .iter()
                .copied()
                .filter(|f| local.get(f).is_some())
                .collect();

            let table_policy = policy.for_table(EntityTable::Deliveries);
            let expected = if overlap.is_empty() {
                ConflictType::None
            } else if overlap.iter().any(|f| table_policy.is_critical(f)) {
                ConflictType::Critical
            } else {
                ConflictType::NonCritical
            };
            prop_assert_eq!(detection.kind, expected);
            prop_assert_eq!(detection.overlap.len(), overlap.len());
        }

        // A successful auto-merge keeps every local mergeable edit and
        // never resurrects a critical overlap.
        #[test]
        fn test_auto_merge_success_iff_no_critical_overlap(
            base_fields in subset(),
            remote_fields in subset(),
            local_fields in subset(),
        ) {
            let policy = ConflictPolicy::default();
            let base = object(&base_fields);
            let remote = object(&remote_fields);
            let local = object(&local_fields);

            let outcome = conflict::auto_merge(
                &policy,
                EntityTable::Deliveries,
                &local,
                &remote,
                &base,
            );

            let table_policy = policy.for_table(EntityTable::Deliveries);
            let critical_overlap = FIELDS.iter().any(|f| {
                table_policy.is_critical(f)
                    && local.get(f).is_some()
                    && base.get(f) != remote.get(f)
            });
            prop_assert_eq!(outcome.success, !critical_overlap);

            for (field, value) in local.as_object().unwrap() {
                let remote_unchanged = base.get(field) == remote.get(field);
                if remote_unchanged || outcome.auto_merged.contains(field) {
                    prop_assert_eq!(outcome.merged_data.get(field), Some(value));
                }
            }
        }
    }
}
