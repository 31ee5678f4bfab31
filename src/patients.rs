//! Patient registry: registration, search and contact maintenance.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Months, NaiveDate, Utc};
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::core_state::CoreError;
use crate::db::{self, write_transaction};
use crate::models::enums::{Gender, PatientStatus};
use crate::models::{ContactInfo, NewPatient, Patient, PatientQuery};
use crate::validator::ValidationError;

/// Oldest accepted date of birth, in years before today.
const MAX_AGE_YEARS: u32 = 150;
const MAX_NAME_LEN: usize = 100;

static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9 ()./-]{7,20}$").unwrap());

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// One page of search results. `next_cursor` is present when another page
/// may follow; pass it back as `after`.
#[derive(Debug, Clone, Serialize)]
pub struct PatientPage {
    pub items: Vec<Patient>,
    pub next_cursor: Option<i64>,
}

/// Validate and store a new patient, assigning the next patient number.
pub fn register_patient(
    conn: &Connection,
    input: &NewPatient,
    now: DateTime<Utc>,
) -> Result<Patient, CoreError> {
    let first_name = required_name(input.first_name.as_deref(), "first_name")?;
    let last_name = required_name(input.last_name.as_deref(), "last_name")?;
    let date_of_birth = parse_birth_date(input.date_of_birth.as_deref(), now.date_naive())?;
    let gender = parse_gender(input.gender.as_deref())?;
    let contact = validate_contact(ContactInfo {
        phone: input.phone.clone().unwrap_or_default(),
        email: input.email.clone(),
        address: input.address.clone(),
    })?;

    let tx = write_transaction(conn)?;
    let seq = db::next_sequence(&tx, "patient")?;
    let patient = Patient {
        id: Uuid::new_v4(),
        patient_number: db::format_identifier("P", seq),
        first_name,
        last_name,
        date_of_birth,
        gender,
        contact,
        status: PatientStatus::Active,
        created_at: now,
        updated_at: now,
    };
    db::insert_patient(&tx, seq, &patient)?;
    tx.commit().map_err(db::DatabaseError::from)?;

    tracing::info!(patient_number = %patient.patient_number, "Registered patient");
    Ok(patient)
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Patient, CoreError> {
    db::get_patient(conn, id)?.ok_or_else(|| CoreError::not_found("Patient", id))
}

/// One bounded page of matches, in registration order.
pub fn find_patients(conn: &Connection, query: &PatientQuery) -> Result<PatientPage, CoreError> {
    let limit = query.page_size();
    let rows = db::find_patients(conn, query, limit)?;
    let next_cursor = if rows.len() as u32 == limit {
        rows.last().map(|(seq, _)| *seq)
    } else {
        None
    };
    Ok(PatientPage {
        items: rows.into_iter().map(|(_, p)| p).collect(),
        next_cursor,
    })
}

/// Lazily walks all pages of a query. Each `next()` runs one bounded query;
/// nothing is held between calls.
pub struct PatientPages<'c> {
    conn: &'c Connection,
    query: PatientQuery,
    done: bool,
}

impl<'c> PatientPages<'c> {
    pub fn new(conn: &'c Connection, query: PatientQuery) -> Self {
        Self {
            conn,
            query,
            done: false,
        }
    }
}

impl Iterator for PatientPages<'_> {
    type Item = Result<Vec<Patient>, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match find_patients(self.conn, &self.query) {
            Ok(page) => {
                match page.next_cursor {
                    Some(cursor) => self.query.after = Some(cursor),
                    None => self.done = true,
                }
                if page.items.is_empty() {
                    return None;
                }
                Some(Ok(page.items))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn update_contact(
    conn: &Connection,
    id: &Uuid,
    contact: ContactInfo,
    now: DateTime<Utc>,
) -> Result<Patient, CoreError> {
    let contact = validate_contact(contact)?;
    let tx = write_transaction(conn)?;
    db::update_patient_contact(&tx, id, &contact, &now)?;
    let patient = get_patient(&tx, id)?;
    tx.commit().map_err(db::DatabaseError::from)?;
    Ok(patient)
}

/// Soft (de)activation. Inactive patients keep their history but cannot
/// receive new orders.
pub fn set_status(
    conn: &Connection,
    id: &Uuid,
    status: PatientStatus,
    now: DateTime<Utc>,
) -> Result<Patient, CoreError> {
    let tx = write_transaction(conn)?;
    db::update_patient_status(&tx, id, status, &now)?;
    let patient = get_patient(&tx, id)?;
    tx.commit().map_err(db::DatabaseError::from)?;
    tracing::info!(patient_number = %patient.patient_number, %status, "Patient status changed");
    Ok(patient)
}

fn required_name(value: Option<&str>, field: &str) -> Result<String, ValidationError> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(ValidationError::new(field, "is required"));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            field,
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(value.to_string())
}

fn parse_birth_date(value: Option<&str>, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let field = "date_of_birth";
    let raw = value.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ValidationError::new(field, "is required"));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ValidationError::new(field, "must be a date in YYYY-MM-DD form"))?;
    if date > today {
        return Err(ValidationError::new(field, "cannot be in the future"));
    }
    let earliest = today
        .checked_sub_months(Months::new(MAX_AGE_YEARS * 12))
        .unwrap_or(NaiveDate::MIN);
    if date < earliest {
        return Err(ValidationError::new(
            field,
            format!("cannot be more than {MAX_AGE_YEARS} years ago"),
        ));
    }
    Ok(date)
}

fn parse_gender(value: Option<&str>) -> Result<Gender, ValidationError> {
    let raw = value.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ValidationError::new("gender", "is required"));
    }
    Gender::from_str(&raw.to_lowercase())
        .map_err(|_| ValidationError::new("gender", "must be male, female or other"))
}

fn validate_contact(contact: ContactInfo) -> Result<ContactInfo, ValidationError> {
    let phone = contact.phone.trim().to_string();
    if phone.is_empty() {
        return Err(ValidationError::new("phone", "is required"));
    }
    if !PHONE.is_match(&phone) {
        return Err(ValidationError::new("phone", "is not a valid phone number"));
    }

    let email = contact
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if let Some(email) = &email {
        if !EMAIL.is_match(email) {
            return Err(ValidationError::new("email", "is not a valid email address"));
        }
    }

    let address = contact
        .address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    Ok(ContactInfo {
        phone,
        email,
        address,
    })
}
