use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::job::DownloadedFile;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("{resource_type} record missing required field {field}")]
    MissingField {
        resource_type: &'static str,
        field: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Serialize)]
pub struct PatientRow {
    pub fhir_id: String,
    pub identifier: Option<Value>,
    pub name: Option<Value>,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub address: Option<Value>,
    pub telecom: Option<Value>,
    pub marital_status: Option<String>,
    pub raw_data: Value,
}

#[derive(Clone, Serialize)]
pub struct ConditionRow {
    pub fhir_id: String,
    pub patient_id: Option<String>,
    pub code: Option<Value>,
    pub code_text: Option<String>,
    pub category: Option<Value>,
    pub clinical_status: Option<String>,
    pub verification_status: Option<Value>,
    pub severity_text: Option<String>,
    pub onset_datetime: Option<String>,
    pub recorded_date: Option<String>,
    pub encounter_id: Option<String>,
    pub raw_data: Value,
}

#[derive(Clone, Serialize)]
pub struct EncounterRow {
    pub fhir_id: String,
    pub patient_id: Option<String>,
    pub status: Option<String>,
    pub encounter_class: Option<String>,
    pub encounter_type: Option<Value>,
    pub service_type_text: Option<String>,
    pub priority_text: Option<String>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub reason_code: Option<Value>,
    pub diagnosis: Option<Value>,
    pub location: Option<Value>,
    pub raw_data: Value,
}

#[derive(Clone, Serialize)]
pub struct ObservationRow {
    pub fhir_id: String,
    pub patient_id: Option<String>,
    pub encounter_id: Option<String>,
    pub status: Option<String>,
    pub category: Option<Value>,
    pub code: Option<Value>,
    pub code_text: Option<String>,
    pub value: Option<Value>,
    pub value_quantity: Option<Value>,
    pub effective_datetime: Option<String>,
    pub issued: Option<String>,
    pub interpretation: Option<Value>,
    pub raw_data: Value,
}

#[derive(Clone)]
pub enum TransformedRows {
    Patients(Vec<PatientRow>),
    Conditions(Vec<ConditionRow>),
    Encounters(Vec<EncounterRow>),
    Observations(Vec<ObservationRow>),
}

impl TransformedRows {
    pub fn len(&self) -> usize {
        match self {
            TransformedRows::Patients(rows) => rows.len(),
            TransformedRows::Conditions(rows) => rows.len(),
            TransformedRows::Encounters(rows) => rows.len(),
            TransformedRows::Observations(rows) => rows.len(),
        }
    }
}

pub struct TransformedFile {
    pub resource_type: String,
    pub path: PathBuf,
    pub rows: TransformedRows,
}

pub struct TransformSummary {
    pub total_transformed: u64,
    pub total_failed: u64,
    pub transformed_files: Vec<TransformedFile>,
}

/// Extracts the last path segment of a `reference`, e.g. `"Patient/123"` →
/// `Some("123")`. Returns `None` when the reference is absent.
fn ref_id(reference: Option<&str>) -> Option<String> {
    reference.and_then(|r| r.rsplit('/').next()).map(str::to_string)
}

fn first_coding_display(codeable_concept: Option<&Value>) -> Option<String> {
    codeable_concept?
        .get("coding")?
        .as_array()?
        .first()?
        .get("display")?
        .as_str()
        .map(str::to_string)
}

fn code_text(codeable_concept: Option<&Value>) -> Option<String> {
    codeable_concept
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| first_coding_display(codeable_concept))
}

fn str_field<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

fn required_id(record: &Value, resource_type: &'static str) -> Result<String, TransformError> {
    str_field(record, "id")
        .map(str::to_string)
        .ok_or(TransformError::MissingField {
            resource_type,
            field: "id",
        })
}

fn transform_patient(record: &Value) -> Result<PatientRow, TransformError> {
    Ok(PatientRow {
        fhir_id: required_id(record, "Patient")?,
        identifier: record.get("identifier").cloned(),
        name: record.get("name").cloned(),
        gender: str_field(record, "gender").map(str::to_string),
        birth_date: str_field(record, "birthDate").map(str::to_string),
        address: record.get("address").cloned(),
        telecom: record.get("telecom").cloned(),
        marital_status: record.pointer("/maritalStatus/text").and_then(Value::as_str).map(str::to_string),
        raw_data: record.clone(),
    })
}

fn transform_condition(record: &Value) -> Result<ConditionRow, TransformError> {
    let code = record.get("code");
    Ok(ConditionRow {
        fhir_id: required_id(record, "Condition")?,
        patient_id: ref_id(record.pointer("/subject/reference").and_then(Value::as_str)),
        code: code.cloned(),
        code_text: code_text(code),
        category: record.get("category").cloned(),
        clinical_status: record.pointer("/clinicalStatus/text").and_then(Value::as_str).map(str::to_string),
        verification_status: record.get("verificationStatus").cloned(),
        severity_text: record.pointer("/severity/text").and_then(Value::as_str).map(str::to_string),
        onset_datetime: str_field(record, "onsetDateTime").map(str::to_string),
        recorded_date: str_field(record, "recordedDate").map(str::to_string),
        encounter_id: ref_id(record.pointer("/encounter/reference").and_then(Value::as_str)),
        raw_data: record.clone(),
    })
}

fn transform_encounter(record: &Value) -> Result<EncounterRow, TransformError> {
    Ok(EncounterRow {
        fhir_id: required_id(record, "Encounter")?,
        patient_id: ref_id(record.pointer("/subject/reference").and_then(Value::as_str)),
        status: str_field(record, "status").map(str::to_string),
        encounter_class: record.pointer("/class/code").and_then(Value::as_str).map(str::to_string),
        encounter_type: record.get("type").cloned(),
        service_type_text: record.pointer("/serviceType/text").and_then(Value::as_str).map(str::to_string),
        priority_text: record.pointer("/priority/text").and_then(Value::as_str).map(str::to_string),
        period_start: record.pointer("/period/start").and_then(Value::as_str).map(str::to_string),
        period_end: record.pointer("/period/end").and_then(Value::as_str).map(str::to_string),
        reason_code: record.get("reasonCode").cloned(),
        diagnosis: record.get("diagnosis").cloned(),
        location: record.get("location").cloned(),
        raw_data: record.clone(),
    })
}

const OBSERVATION_VALUE_FIELDS: &[&str] = &[
    "valueQuantity",
    "valueCodeableConcept",
    "valueString",
    "valueBoolean",
    "valueInteger",
    "valueRange",
    "valueRatio",
    "valueSampledData",
    "valueDateTime",
    "valuePeriod",
    "valueTime",
];

fn transform_observation(record: &Value) -> Result<ObservationRow, TransformError> {
    let code = record.get("code");
    let value = OBSERVATION_VALUE_FIELDS
        .iter()
        .find_map(|field| record.get(*field).cloned());

    Ok(ObservationRow {
        fhir_id: required_id(record, "Observation")?,
        patient_id: ref_id(record.pointer("/subject/reference").and_then(Value::as_str)),
        encounter_id: ref_id(record.pointer("/encounter/reference").and_then(Value::as_str)),
        status: str_field(record, "status").map(str::to_string),
        category: record.get("category").cloned(),
        code: code.cloned(),
        code_text: code_text(code),
        value,
        value_quantity: record.get("valueQuantity").cloned(),
        effective_datetime: str_field(record, "effectiveDateTime").map(str::to_string),
        issued: str_field(record, "issued").map(str::to_string),
        interpretation: record.get("interpretation").cloned(),
        raw_data: record.clone(),
    })
}

async fn transform_file(path: &Path, resource_type: &str) -> Result<(TransformedRows, u64), TransformError> {
    let contents = tokio::fs::read_to_string(path).await?;

    macro_rules! extract_lines {
        ($extractor:ident, $variant:ident) => {{
            let mut rows = Vec::new();
            let mut failed = 0u64;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Value>(line).and_then(|v| Ok($extractor(&v))) {
                    Ok(Ok(row)) => rows.push(row),
                    Ok(Err(err)) => {
                        warn!(error = %err, "skipping record that failed extraction");
                        failed += 1;
                    }
                    Err(err) => {
                        warn!(error = %err, "skipping line that failed json parse");
                        failed += 1;
                    }
                }
            }
            (TransformedRows::$variant(rows), failed)
        }};
    }

    let (rows, failed) = match resource_type {
        "Patient" => extract_lines!(transform_patient, Patients),
        "Condition" => extract_lines!(transform_condition, Conditions),
        "Encounter" => extract_lines!(transform_encounter, Encounters),
        "Observation" => extract_lines!(transform_observation, Observations),
        other => {
            warn!(resource_type = other, "no transformer registered for resource type, skipping file");
            (TransformedRows::Patients(Vec::new()), 0)
        }
    };

    Ok((rows, failed))
}

fn write_rows(path: &Path, rows: &TransformedRows) -> Result<(), TransformError> {
    let json = match rows {
        TransformedRows::Patients(rows) => serde_json::to_vec_pretty(rows)?,
        TransformedRows::Conditions(rows) => serde_json::to_vec_pretty(rows)?,
        TransformedRows::Encounters(rows) => serde_json::to_vec_pretty(rows)?,
        TransformedRows::Observations(rows) => serde_json::to_vec_pretty(rows)?,
    };
    std::fs::write(path, json)?;
    Ok(())
}

/// Transforms every downloaded file for a job into normalized rows,
/// returning both the in-memory rows (for the loader) and the on-disk
/// `transformed/<Type>.json` path (for auditability and resume).
pub async fn transform_job_files(
    job_dir: &Path,
    files: &[DownloadedFile],
) -> Result<TransformSummary, TransformError> {
    let transformed_dir = job_dir.join("transformed");
    tokio::fs::create_dir_all(&transformed_dir).await?;

    let mut total_transformed = 0u64;
    let mut total_failed = 0u64;
    let mut transformed_files = Vec::with_capacity(files.len());

    for file in files {
        let (rows, failed) = transform_file(Path::new(&file.local_path), &file.resource_type).await?;
        total_transformed += rows.len() as u64;
        total_failed += failed;

        let out_path = transformed_dir.join(format!("{}.json", file.resource_type));
        write_rows(&out_path, &rows)?;

        transformed_files.push(TransformedFile {
            resource_type: file.resource_type.clone(),
            path: out_path,
            rows,
        });
    }

    Ok(TransformSummary {
        total_transformed,
        total_failed,
        transformed_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_id_strips_resource_type_prefix() {
        assert_eq!(ref_id(Some("Patient/123")), Some("123".to_string()));
        assert_eq!(ref_id(None), None);
    }

    #[test]
    fn code_text_falls_back_to_first_coding_display() {
        let code = json!({ "coding": [{ "display": "Hypertension" }] });
        assert_eq!(code_text(Some(&code)), Some("Hypertension".to_string()));
    }

    #[test]
    fn code_text_prefers_explicit_text() {
        let code = json!({ "text": "explicit", "coding": [{ "display": "fallback" }] });
        assert_eq!(code_text(Some(&code)), Some("explicit".to_string()));
    }

    #[test]
    fn transform_patient_extracts_declared_fields() {
        let record = json!({
            "id": "p1",
            "gender": "female",
            "birthDate": "1980-01-01",
            "maritalStatus": { "text": "Married" },
        });
        let row = transform_patient(&record).unwrap();
        assert_eq!(row.fhir_id, "p1");
        assert_eq!(row.gender.as_deref(), Some("female"));
        assert_eq!(row.marital_status.as_deref(), Some("Married"));
    }

    #[test]
    fn transform_patient_requires_id() {
        let record = json!({ "gender": "female" });
        assert!(matches!(
            transform_patient(&record),
            Err(TransformError::MissingField { field: "id", .. })
        ));
    }

    #[test]
    fn transform_condition_derives_patient_and_encounter_ids() {
        let record = json!({
            "id": "c1",
            "subject": { "reference": "Patient/p1" },
            "encounter": { "reference": "Encounter/e1" },
            "code": { "text": "Diabetes" },
        });
        let row = transform_condition(&record).unwrap();
        assert_eq!(row.patient_id.as_deref(), Some("p1"));
        assert_eq!(row.encounter_id.as_deref(), Some("e1"));
        assert_eq!(row.code_text.as_deref(), Some("Diabetes"));
    }

    #[test]
    fn transform_observation_picks_first_present_value_field() {
        let record = json!({
            "id": "o1",
            "valueQuantity": { "value": 98.6, "unit": "F" },
        });
        let row = transform_observation(&record).unwrap();
        assert!(row.value.is_some());
        assert!(row.value_quantity.is_some());
    }
}
