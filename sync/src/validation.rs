//! Minimal local validation at the offline boundary.
//!
//! Errors block enqueue and are returned synchronously; warnings travel
//! with the cached entity as `validation_warnings` so the agent can fix
//! them later without losing the record.

use ct_core::types::{EntityTable, OperationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn require_string(report: &mut ValidationReport, data: &Value, key: &str) {
    match str_field(data, key) {
        Some(value) if !value.trim().is_empty() => {}
        _ => report.errors.push(format!("{key} is required")),
    }
}

fn require_positive(report: &mut ValidationReport, data: &Value, key: &str) {
    match data.get(key) {
        Some(value) if utils::is_positive_number(value) => {}
        Some(_) => report.errors.push(format!("{key} must be a positive number")),
        None => report.errors.push(format!("{key} is required")),
    }
}

fn check_positive_if_present(report: &mut ValidationReport, data: &Value, key: &str) {
    if let Some(value) = data.get(key)
        && !value.is_null()
        && !utils::is_positive_number(value)
    {
        report.errors.push(format!("{key} must be a positive number"));
    }
}

fn check_uuid(report: &mut ValidationReport, data: &Value, key: &str) {
    if let Some(value) = str_field(data, key)
        && !utils::is_valid_uuid_v4(value)
    {
        report.errors.push(format!("{key} must be a valid UUID"));
    }
}

fn warn_phone(report: &mut ValidationReport, data: &Value, key: &str) {
    if let Some(value) = str_field(data, key)
        && !value.is_empty()
        && !utils::is_valid_phone(value)
    {
        report.warnings.push(format!("{key} has an unusual format"));
    }
}

fn warn_cni(report: &mut ValidationReport, data: &Value, key: &str) {
    if let Some(value) = str_field(data, key)
        && !value.is_empty()
        && !utils::is_valid_cni(value)
    {
        report.warnings.push(format!("{key} has an unusual format"));
    }
}

/// Validate one mutation payload. DELETE carries no payload to check.
#[must_use]
pub fn validate(table: EntityTable, op_type: OperationType, data: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    if op_type == OperationType::Delete {
        return report;
    }
    if !data.is_object() {
        report.errors.push("payload must be an object".to_string());
        return report;
    }
    let creating = op_type == OperationType::Create;

    match table {
        EntityTable::Deliveries => {
            if creating {
                require_string(&mut report, data, "planteur_id");
                require_positive(&mut report, data, "weight_kg");
                require_string(&mut report, data, "delivered_at");
            } else {
                check_positive_if_present(&mut report, data, "weight_kg");
            }
            check_uuid(&mut report, data, "planteur_id");
            check_positive_if_present(&mut report, data, "price_per_kg");
            check_positive_if_present(&mut report, data, "total_amount");
            if creating && str_field(data, "quality_grade").is_none() {
                report.warnings.push("quality_grade not recorded".to_string());
            }
        }
        EntityTable::Planteurs | EntityTable::ChefPlanteurs => {
            if creating {
                require_string(&mut report, data, "name");
            }
            check_uuid(&mut report, data, "chef_planteur_id");
            check_positive_if_present(&mut report, data, "surface_ha");
            warn_phone(&mut report, data, "phone");
            warn_cni(&mut report, data, "cni");
        }
        EntityTable::Warehouses => {
            if creating {
                require_string(&mut report, data, "name");
            }
            check_positive_if_present(&mut report, data, "capacity_tonnes");
            warn_phone(&mut report, data, "phone");
        }
    }
    report
}
