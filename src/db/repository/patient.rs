use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const PATIENT_COLUMNS: &str = "id, seq, patient_number, first_name, last_name, date_of_birth,
     gender, phone, email, address, status, created_at, updated_at";

pub fn insert_patient(conn: &Connection, seq: i64, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, seq, patient_number, first_name, last_name, date_of_birth,
         gender, phone, email, address, status, created_at, updated_at, search_text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            patient.id.to_string(),
            seq,
            patient.patient_number,
            patient.first_name,
            patient.last_name,
            patient.date_of_birth.to_string(),
            patient.gender.as_str(),
            patient.contact.phone,
            patient.contact.email,
            patient.contact.address,
            patient.status.as_str(),
            format_timestamp(&patient.created_at),
            format_timestamp(&patient.updated_at),
            search_text(patient),
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<Patient>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1"),
            params![id.to_string()],
            patient_row_from_rusqlite,
        )
        .optional()?;
    row.map(|r| patient_from_row(r).map(|(_, p)| p)).transpose()
}

/// Keyset-paged search ordered by registration sequence.
///
/// Returns `(seq, patient)` pairs so the caller can build the next cursor.
pub fn find_patients(
    conn: &Connection,
    query: &PatientQuery,
    limit: u32,
) -> Result<Vec<(i64, Patient)>, DatabaseError> {
    let pattern = query
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!("%{}%", escape_like(&fold(t))));

    let mut stmt = conn.prepare(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients
         WHERE (?1 IS NULL OR search_text LIKE ?1 ESCAPE '\\')
           AND (?2 IS NULL OR status = ?2)
           AND (?3 IS NULL OR seq > ?3)
         ORDER BY seq
         LIMIT ?4"
    ))?;

    let rows = stmt.query_map(
        params![
            pattern,
            query.status.map(|s| s.as_str()),
            query.after,
            limit,
        ],
        patient_row_from_rusqlite,
    )?;

    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?);
    }
    Ok(patients)
}

pub fn update_patient_contact(
    conn: &Connection,
    id: &Uuid,
    contact: &ContactInfo,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let Some(mut patient) = get_patient(conn, id)? else {
        return ensure_found(0, id);
    };
    patient.contact = contact.clone();
    let changed = conn.execute(
        "UPDATE patients SET phone = ?2, email = ?3, address = ?4, updated_at = ?5,
         search_text = ?6 WHERE id = ?1",
        params![
            id.to_string(),
            contact.phone,
            contact.email,
            contact.address,
            format_timestamp(now),
            search_text(&patient),
        ],
    )?;
    ensure_found(changed, id)
}

pub fn update_patient_status(
    conn: &Connection,
    id: &Uuid,
    status: PatientStatus,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE patients SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), status.as_str(), format_timestamp(now)],
    )?;
    ensure_found(changed, id)
}

fn ensure_found(changed: usize, id: &Uuid) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Patient".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Fill `search_text` for rows written before the column existed.
pub fn backfill_patient_search(conn: &Connection) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients WHERE search_text = ''"
    ))?;
    let rows = stmt.query_map([], patient_row_from_rusqlite)?;
    let mut patients = Vec::new();
    for row in rows {
        patients.push(patient_from_row(row?)?.1);
    }
    for patient in &patients {
        conn.execute(
            "UPDATE patients SET search_text = ?2 WHERE id = ?1",
            params![patient.id.to_string(), search_text(patient)],
        )?;
    }
    Ok(patients.len())
}

/// Unicode-aware case fold shared by stored search text and queries.
fn fold(text: &str) -> String {
    text.to_lowercase()
}

/// Searchable fields, newline-separated so ordinary queries match within one field.
fn search_text(patient: &Patient) -> String {
    fold(&format!(
        "{}\n{}\n{}\n{} {}\n{}",
        patient.patient_number,
        patient.first_name,
        patient.last_name,
        patient.first_name,
        patient.last_name,
        patient.contact.phone,
    ))
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

// Internal row type for Patient mapping
struct PatientRow {
    id: String,
    seq: i64,
    patient_number: String,
    first_name: String,
    last_name: String,
    date_of_birth: String,
    gender: String,
    phone: String,
    email: Option<String>,
    address: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

fn patient_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<PatientRow, rusqlite::Error> {
    Ok(PatientRow {
        id: row.get(0)?,
        seq: row.get(1)?,
        patient_number: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        date_of_birth: row.get(5)?,
        gender: row.get(6)?,
        phone: row.get(7)?,
        email: row.get(8)?,
        address: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn patient_from_row(row: PatientRow) -> Result<(i64, Patient), DatabaseError> {
    let date_of_birth = NaiveDate::parse_from_str(&row.date_of_birth, "%Y-%m-%d")
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    Ok((
        row.seq,
        Patient {
            id: parse_uuid(&row.id)?,
            patient_number: row.patient_number,
            first_name: row.first_name,
            last_name: row.last_name,
            date_of_birth,
            gender: Gender::from_str(&row.gender)?,
            contact: ContactInfo {
                phone: row.phone,
                email: row.email,
                address: row.address,
            },
            status: PatientStatus::from_str(&row.status)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        },
    ))
}
