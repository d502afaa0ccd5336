//! Conflict detection and resolution over a three-way diff.
//!
//! The merge base travels on the op (`base_snapshot`), so the detector can
//! tell "remote changed under us" apart from "we changed an unchanged
//! field". Per-table field policy decides what happens when both sides
//! touched the same field: financial/identity fields go to the user,
//! descriptive fields auto-merge with local-wins, everything else defers
//! to the server.

use ct_core::traits::ServerConflict;
use ct_core::types::{ConflictInfo, EntityTable, FieldConflict, OperationType};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Resolution strategy for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStrategy {
    /// Critical: conflicting edits require a user decision.
    UserChooses,
    /// Mergeable: local wins automatically.
    AutoMerge,
    /// Everything else: the server's value stands.
    ServerWins,
}

/// Overall classification of one detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    None,
    Critical,
    NonCritical,
}

/// Per-table critical/mergeable field sets. The two sets are disjoint by
/// construction; `debug_assert` guards the invariant for custom policies.
#[derive(Debug, Clone)]
pub struct FieldPolicy {
    critical: HashSet<&'static str>,
    mergeable: HashSet<&'static str>,
}

impl FieldPolicy {
    #[must_use]
    pub fn new(critical: &[&'static str], mergeable: &[&'static str]) -> Self {
        let policy = Self {
            critical: critical.iter().copied().collect(),
            mergeable: mergeable.iter().copied().collect(),
        };
        debug_assert!(
            policy.critical.is_disjoint(&policy.mergeable),
            "critical and mergeable field sets overlap"
        );
        policy
    }

    #[must_use]
    pub fn strategy_for(&self, field: &str) -> FieldStrategy {
        if self.critical.contains(field) {
            FieldStrategy::UserChooses
        } else if self.mergeable.contains(field) {
            FieldStrategy::AutoMerge
        } else {
            FieldStrategy::ServerWins
        }
    }

    #[must_use]
    pub fn is_critical(&self, field: &str) -> bool {
        self.critical.contains(field)
    }
}

/// Field policies for every synced table.
#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    tables: HashMap<EntityTable, FieldPolicy>,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        let mut tables = HashMap::new();
        tables.insert(
            EntityTable::Deliveries,
            FieldPolicy::new(
                &[
                    "weight_kg",
                    "price_per_kg",
                    "total_amount",
                    "payment_status",
                    "payment_amount_paid",
                    "planteur_id",
                ],
                &["notes", "metadata", "quality_grade"],
            ),
        );
        tables.insert(
            EntityTable::Planteurs,
            FieldPolicy::new(
                &["name", "cni", "code", "cooperative_id"],
                &["phone", "village", "region", "gps_lat", "gps_lng", "notes"],
            ),
        );
        tables.insert(
            EntityTable::ChefPlanteurs,
            FieldPolicy::new(
                &["name", "cni", "code", "cooperative_id"],
                &["phone", "village", "region", "notes"],
            ),
        );
        tables.insert(
            EntityTable::Warehouses,
            FieldPolicy::new(&["name", "code", "cooperative_id"], &["notes", "address", "phone"]),
        );
        Self { tables }
    }
}

impl ConflictPolicy {
    #[must_use]
    pub fn for_table(&self, table: EntityTable) -> &FieldPolicy {
        self.tables
            .get(&table)
            .unwrap_or_else(|| &self.tables[&EntityTable::Deliveries])
    }

    #[must_use]
    pub fn strategy_for(&self, table: EntityTable, field: &str) -> FieldStrategy {
        self.for_table(table).strategy_for(field)
    }
}

/// Result of the three-way diff.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: ConflictType,
    pub remote_changed: Vec<String>,
    pub overlap: Vec<String>,
    pub fields: Vec<FieldConflict>,
}

impl Detection {
    fn none() -> Self {
        Self {
            kind: ConflictType::None,
            remote_changed: Vec::new(),
            overlap: Vec::new(),
            fields: Vec::new(),
        }
    }
}

fn object_keys(value: &Value) -> BTreeSet<String> {
    value
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn field(value: &Value, key: &str) -> Value {
    value.get(key).cloned().unwrap_or(Value::Null)
}

/// Three-way diff of `(base, remote, local)` for one queued UPDATE.
///
/// `remote_changed = {f : remote[f] != base[f]}`, `local_changed` is the
/// keys of the op's `data`; a non-empty overlap is a conflict, critical
/// iff it touches a critical field.
#[must_use]
pub fn detect(
    policy: &ConflictPolicy,
    table: EntityTable,
    op_type: OperationType,
    base: Option<&Value>,
    remote: &Value,
    local: &Value,
) -> Detection {
    let Some(base) = base else {
        return Detection::none();
    };
    if op_type != OperationType::Update {
        return Detection::none();
    }

    let mut remote_changed: Vec<String> = object_keys(remote)
        .union(&object_keys(base))
        .filter(|key| field(remote, key) != field(base, key))
        .cloned()
        .collect();
    remote_changed.sort();

    let local_changed = object_keys(local);
    let overlap: Vec<String> = remote_changed
        .iter()
        .filter(|key| local_changed.contains(*key))
        .cloned()
        .collect();

    if overlap.is_empty() {
        return Detection {
            kind: ConflictType::None,
            remote_changed,
            overlap,
            fields: Vec::new(),
        };
    }

    let table_policy = policy.for_table(table);
    let fields: Vec<FieldConflict> = overlap
        .iter()
        .map(|key| FieldConflict {
            field: key.clone(),
            local_value: field(local, key),
            server_value: field(remote, key),
            is_critical: table_policy.is_critical(key),
        })
        .collect();

    let kind = if fields.iter().any(|f| f.is_critical) {
        ConflictType::Critical
    } else {
        ConflictType::NonCritical
    };
    Detection {
        kind,
        remote_changed,
        overlap,
        fields,
    }
}

/// Outcome of an automatic merge attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged_data: Value,
    pub requires_user_choice: Vec<String>,
    pub auto_merged: Vec<String>,
    pub server_wins: Vec<String>,
    pub success: bool,
}

/// Merge `local` over `remote` against `base`, field by field.
///
/// A locally-changed field the remote did not touch takes the local
/// value; a both-changed field follows its strategy. Any critical
/// both-changed field fails the merge and lands in
/// `requires_user_choice`.
#[must_use]
pub fn auto_merge(
    policy: &ConflictPolicy,
    table: EntityTable,
    local: &Value,
    remote: &Value,
    base: &Value,
) -> MergeOutcome {
    let table_policy = policy.for_table(table);
    let mut merged = remote.clone();
    if !merged.is_object() {
        merged = Value::Object(serde_json::Map::new());
    }
    let mut requires_user_choice = Vec::new();
    let mut auto_merged = Vec::new();
    let mut server_wins = Vec::new();

    for key in object_keys(local) {
        let local_value = field(local, &key);
        let remote_unchanged = field(remote, &key) == field(base, &key);
        if remote_unchanged {
            merged[&key] = local_value;
            continue;
        }
        match table_policy.strategy_for(&key) {
            FieldStrategy::UserChooses => requires_user_choice.push(key),
            FieldStrategy::AutoMerge => {
                merged[&key] = local_value;
                auto_merged.push(key);
            }
            FieldStrategy::ServerWins => server_wins.push(key),
        }
    }

    let success = requires_user_choice.is_empty();
    MergeOutcome {
        merged_data: merged,
        requires_user_choice,
        auto_merged,
        server_wins,
        success,
    }
}

/// Conflict payload from a pre-flight detection.
#[must_use]
pub fn conflict_info_from_detection(
    detection: &Detection,
    remote: &Value,
    client_version: Option<i64>,
) -> ConflictInfo {
    ConflictInfo {
        server_version: remote
            .get("row_version")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        client_version: client_version.unwrap_or_default(),
        server_updated_at: remote
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        server_updated_by: None,
        fields: detection.fields.clone(),
    }
}

/// Conflict payload parsed out of a server 409 body.
#[must_use]
pub fn conflict_info_from_server(
    policy: &ConflictPolicy,
    table: EntityTable,
    local: &Value,
    conflict: &ServerConflict,
) -> ConflictInfo {
    let table_policy = policy.for_table(table);
    let fields = conflict
        .fields_changed
        .iter()
        .map(|name| FieldConflict {
            field: name.clone(),
            local_value: field(local, name),
            server_value: field(&conflict.server_data, name),
            is_critical: table_policy.is_critical(name),
        })
        .collect();
    ConflictInfo {
        server_version: conflict.server_version,
        client_version: conflict.client_version,
        server_updated_at: conflict.server_updated_at,
        server_updated_by: conflict.server_updated_by.clone(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> ConflictPolicy {
        ConflictPolicy::default()
    }

    #[test]
    fn test_no_conflict_without_base() {
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Update,
            None,
            &json!({"weight_kg": 110}),
            &json!({"weight_kg": 120}),
        );
        assert_eq!(detection.kind, ConflictType::None);
    }

    #[test]
    fn test_no_conflict_for_create() {
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Create,
            Some(&json!({})),
            &json!({"weight_kg": 110}),
            &json!({"weight_kg": 120}),
        );
        assert_eq!(detection.kind, ConflictType::None);
    }

    #[test]
    fn test_disjoint_edits_are_no_conflict() {
        let base = json!({"weight_kg": 100, "notes": "x"});
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Update,
            Some(&base),
            &json!({"weight_kg": 100, "notes": "z"}),
            &json!({"weight_kg": 120}),
        );
        assert_eq!(detection.kind, ConflictType::None);
        assert_eq!(detection.remote_changed, vec!["notes".to_string()]);
    }

    #[test]
    fn test_critical_overlap_escalates() {
        // Both sides changed weight_kg.
        let base = json!({"weight_kg": 100, "notes": "x"});
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Update,
            Some(&base),
            &json!({"weight_kg": 110, "notes": "x"}),
            &json!({"weight_kg": 120, "notes": "y"}),
        );
        assert_eq!(detection.kind, ConflictType::Critical);
        assert_eq!(detection.overlap, vec!["weight_kg".to_string()]);
        assert!(detection.fields[0].is_critical);
        assert_eq!(detection.fields[0].local_value, json!(120));
        assert_eq!(detection.fields[0].server_value, json!(110));
    }

    #[test]
    fn test_mergeable_overlap_is_non_critical() {
        let base = json!({"weight_kg": 100, "notes": "x"});
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Update,
            Some(&base),
            &json!({"weight_kg": 100, "notes": "z"}),
            &json!({"notes": "y"}),
        );
        assert_eq!(detection.kind, ConflictType::NonCritical);
    }

    #[test]
    fn test_remote_deleted_field_counts_as_changed() {
        let base = json!({"weight_kg": 100, "notes": "x"});
        let detection = detect(
            &policy(),
            EntityTable::Deliveries,
            OperationType::Update,
            Some(&base),
            &json!({"weight_kg": 100}),
            &json!({"notes": "y"}),
        );
        assert_eq!(detection.kind, ConflictType::NonCritical);
        assert_eq!(detection.overlap, vec!["notes".to_string()]);
    }

    #[test]
    fn test_auto_merge_local_wins_on_mergeable() {
        // notes is mergeable and both sides changed it.
        let base = json!({"weight_kg": 100, "notes": "x"});
        let outcome = auto_merge(
            &policy(),
            EntityTable::Deliveries,
            &json!({"notes": "y"}),
            &json!({"weight_kg": 100, "notes": "z"}),
            &base,
        );
        assert!(outcome.success);
        assert_eq!(outcome.merged_data["notes"], json!("y"));
        assert_eq!(outcome.auto_merged, vec!["notes".to_string()]);
        assert!(outcome.requires_user_choice.is_empty());
    }

    #[test]
    fn test_auto_merge_fails_on_critical_overlap() {
        let base = json!({"weight_kg": 100, "notes": "x"});
        let outcome = auto_merge(
            &policy(),
            EntityTable::Deliveries,
            &json!({"weight_kg": 120, "notes": "y"}),
            &json!({"weight_kg": 110, "notes": "x"}),
            &base,
        );
        assert!(!outcome.success);
        assert_eq!(outcome.requires_user_choice, vec!["weight_kg".to_string()]);
        // notes: remote unchanged, local taken quietly.
        assert_eq!(outcome.merged_data["notes"], json!("y"));
        // weight stays at the server value until the user chooses.
        assert_eq!(outcome.merged_data["weight_kg"], json!(110));
    }

    #[test]
    fn test_auto_merge_server_wins_for_unclassified() {
        let base = json!({"quantity_bags": 10});
        let outcome = auto_merge(
            &policy(),
            EntityTable::Deliveries,
            &json!({"quantity_bags": 12}),
            &json!({"quantity_bags": 11}),
            &base,
        );
        assert!(outcome.success);
        assert_eq!(outcome.merged_data["quantity_bags"], json!(11));
        assert_eq!(outcome.server_wins, vec!["quantity_bags".to_string()]);
    }

    #[test]
    fn test_planteur_contact_fields_merge() {
        let base = json!({"name": "Kouamé", "phone": "0701020304"});
        let outcome = auto_merge(
            &policy(),
            EntityTable::Planteurs,
            &json!({"phone": "0705060708"}),
            &json!({"name": "Kouamé", "phone": "0709090909"}),
            &base,
        );
        assert!(outcome.success);
        assert_eq!(outcome.merged_data["phone"], json!("0705060708"));
    }

    #[test]
    fn test_409_parsing_builds_field_conflicts() {
        let server = ServerConflict {
            server_version: 5,
            client_version: 3,
            server_data: json!({"weight_kg": 110, "notes": "z"}),
            server_updated_at: Some(chrono::Utc::now()),
            server_updated_by: Some("agent-b".to_string()),
            fields_changed: vec!["weight_kg".to_string(), "notes".to_string()],
        };
        let info = conflict_info_from_server(
            &policy(),
            EntityTable::Deliveries,
            &json!({"weight_kg": 120, "notes": "y"}),
            &server,
        );
        assert_eq!(info.server_version, 5);
        assert_eq!(info.client_version, 3);
        assert_eq!(info.fields.len(), 2);
        let weight = info.fields.iter().find(|f| f.field == "weight_kg").unwrap();
        assert!(weight.is_critical);
        assert_eq!(weight.local_value, json!(120));
        assert_eq!(weight.server_value, json!(110));
        let notes = info.fields.iter().find(|f| f.field == "notes").unwrap();
        assert!(!notes.is_critical);
    }

    #[test]
    fn test_field_sets_are_disjoint_per_table() {
        let policy = policy();
        for table in ct_core::types::EntityTable::ALL {
            let table_policy = policy.for_table(table);
            assert!(
                table_policy.critical.is_disjoint(&table_policy.mergeable),
                "{table} field sets overlap"
            );
        }
    }
}
