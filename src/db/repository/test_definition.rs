use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const DEFINITION_COLUMNS: &str =
    "id, code, version, name, category, sample_type, is_current, created_by, created_at";

/// Write one definition version together with its parameter list.
pub fn insert_test_definition(
    conn: &Connection,
    definition: &TestDefinition,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO test_definitions (id, code, version, name, category, sample_type,
         is_current, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            definition.id.to_string(),
            definition.code,
            definition.version,
            definition.name,
            definition.category.as_str(),
            definition.sample_type.as_str(),
            definition.is_current as i32,
            definition.created_by,
            format_timestamp(&definition.created_at),
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO test_parameters (definition_id, position, name, unit, kind,
         reference_range, critical_values, mandatory)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (position, param) in definition.parameters.iter().enumerate() {
        stmt.execute(params![
            definition.id.to_string(),
            position as i64,
            param.name,
            param.unit,
            param.kind.as_str(),
            param.reference_range,
            param.critical_values,
            param.mandatory as i32,
        ])?;
    }
    Ok(())
}

pub fn get_test_definition(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<TestDefinition>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {DEFINITION_COLUMNS} FROM test_definitions WHERE id = ?1"),
            params![id.to_string()],
            definition_row_from_rusqlite,
        )
        .optional()?;
    row.map(|r| definition_from_row(conn, r)).transpose()
}

/// The version new orders bind to for `code`.
pub fn get_current_definition(
    conn: &Connection,
    code: &str,
) -> Result<Option<TestDefinition>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {DEFINITION_COLUMNS} FROM test_definitions
                 WHERE code = ?1 AND is_current = 1"
            ),
            params![code],
            definition_row_from_rusqlite,
        )
        .optional()?;
    row.map(|r| definition_from_row(conn, r)).transpose()
}

pub fn list_current_definitions(
    conn: &Connection,
    filter: &DefinitionFilter,
) -> Result<Vec<TestDefinition>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEFINITION_COLUMNS} FROM test_definitions
         WHERE is_current = 1 AND (?1 IS NULL OR category = ?1)
         ORDER BY code"
    ))?;
    let rows = stmt.query_map(
        params![filter.category.map(|c| c.as_str())],
        definition_row_from_rusqlite,
    )?;
    collect_definitions(conn, rows)
}

/// Every stored version of `code`, oldest first.
pub fn list_definition_versions(
    conn: &Connection,
    code: &str,
) -> Result<Vec<TestDefinition>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEFINITION_COLUMNS} FROM test_definitions WHERE code = ?1 ORDER BY version"
    ))?;
    let rows = stmt.query_map(params![code], definition_row_from_rusqlite)?;
    collect_definitions(conn, rows)
}

/// Retire the current version of `code`. Content columns stay frozen.
pub fn mark_superseded(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE test_definitions SET is_current = 0 WHERE id = ?1 AND is_current = 1",
        params![id.to_string()],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "TestDefinition".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

pub fn count_test_definitions(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM test_definitions", [], |row| row.get(0))?;
    Ok(count)
}

fn load_parameters(conn: &Connection, definition_id: &str) -> Result<Vec<Parameter>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT name, unit, kind, reference_range, critical_values, mandatory
         FROM test_parameters WHERE definition_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![definition_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, i32>(5)?,
        ))
    })?;

    let mut parameters = Vec::new();
    for row in rows {
        let (name, unit, kind, reference_range, critical_values, mandatory) = row?;
        parameters.push(Parameter {
            name,
            unit,
            kind: ParameterKind::from_str(&kind)?,
            reference_range,
            critical_values,
            mandatory: mandatory != 0,
        });
    }
    Ok(parameters)
}

fn collect_definitions(
    conn: &Connection,
    rows: impl Iterator<Item = Result<DefinitionRow, rusqlite::Error>>,
) -> Result<Vec<TestDefinition>, DatabaseError> {
    let mut definitions = Vec::new();
    for row in rows {
        definitions.push(definition_from_row(conn, row?)?);
    }
    Ok(definitions)
}

// Internal row type for TestDefinition mapping
struct DefinitionRow {
    id: String,
    code: String,
    version: i64,
    name: String,
    category: String,
    sample_type: String,
    is_current: i32,
    created_by: String,
    created_at: String,
}

fn definition_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<DefinitionRow, rusqlite::Error> {
    Ok(DefinitionRow {
        id: row.get(0)?,
        code: row.get(1)?,
        version: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
        sample_type: row.get(5)?,
        is_current: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn definition_from_row(conn: &Connection, row: DefinitionRow) -> Result<TestDefinition, DatabaseError> {
    let parameters = load_parameters(conn, &row.id)?;
    Ok(TestDefinition {
        id: parse_uuid(&row.id)?,
        code: row.code,
        version: row.version,
        name: row.name,
        category: TestCategory::from_str(&row.category)?,
        sample_type: SampleType::from_str(&row.sample_type)?,
        is_current: row.is_current != 0,
        parameters,
        created_by: row.created_by,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn glucose_definition(version: i64, reference_range: &str) -> TestDefinition {
        TestDefinition {
            id: Uuid::new_v4(),
            code: "GLU".into(),
            version,
            name: "Fasting Glucose".into(),
            category: TestCategory::Chemistry,
            sample_type: SampleType::Serum,
            is_current: true,
            parameters: vec![Parameter {
                name: "Glucose".into(),
                unit: Some("mg/dL".into()),
                kind: ParameterKind::Numeric,
                reference_range: Some(reference_range.into()),
                critical_values: Some("<40 or >400".into()),
                mandatory: true,
            }],
            created_by: "admin-1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn definition_round_trips_with_parameters() {
        let conn = open_memory_database().unwrap();
        let def = glucose_definition(1, "70-100");
        insert_test_definition(&conn, &def).unwrap();

        let fetched = get_test_definition(&conn, &def.id).unwrap().unwrap();
        assert_eq!(fetched.code, "GLU");
        assert_eq!(fetched.parameters, def.parameters);
        assert!(fetched.is_current);

        let current = get_current_definition(&conn, "GLU").unwrap().unwrap();
        assert_eq!(current.id, def.id);
        assert_eq!(count_test_definitions(&conn).unwrap(), 1);
    }

    #[test]
    fn superseding_moves_current_marker() {
        let conn = open_memory_database().unwrap();
        let v1 = glucose_definition(1, "70-100");
        insert_test_definition(&conn, &v1).unwrap();
        mark_superseded(&conn, &v1.id).unwrap();
        let v2 = glucose_definition(2, "70-99");
        insert_test_definition(&conn, &v2).unwrap();

        let current = get_current_definition(&conn, "GLU").unwrap().unwrap();
        assert_eq!(current.version, 2);

        let history = list_definition_versions(&conn, "GLU").unwrap();
        assert_eq!(history.iter().map(|d| d.version).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!history[0].is_current);
        assert_eq!(
            history[0].parameters[0].reference_range.as_deref(),
            Some("70-100")
        );
    }

    #[test]
    fn two_current_versions_of_one_code_are_rejected() {
        let conn = open_memory_database().unwrap();
        insert_test_definition(&conn, &glucose_definition(1, "70-100")).unwrap();
        assert!(insert_test_definition(&conn, &glucose_definition(2, "70-99")).is_err());
    }

    #[test]
    fn stored_versions_cannot_be_edited() {
        let conn = open_memory_database().unwrap();
        let def = glucose_definition(1, "70-100");
        insert_test_definition(&conn, &def).unwrap();

        let rename = conn.execute(
            "UPDATE test_definitions SET name = 'Other' WHERE id = ?1",
            params![def.id.to_string()],
        );
        assert!(rename.is_err());

        let widen = conn.execute(
            "UPDATE test_parameters SET reference_range = '0-1000' WHERE definition_id = ?1",
            params![def.id.to_string()],
        );
        assert!(widen.is_err());
    }

    #[test]
    fn list_filters_by_category() {
        let conn = open_memory_database().unwrap();
        insert_test_definition(&conn, &glucose_definition(1, "70-100")).unwrap();

        let chemistry = list_current_definitions(
            &conn,
            &DefinitionFilter { category: Some(TestCategory::Chemistry) },
        )
        .unwrap();
        assert_eq!(chemistry.len(), 1);

        let hematology = list_current_definitions(
            &conn,
            &DefinitionFilter { category: Some(TestCategory::Hematology) },
        )
        .unwrap();
        assert!(hematology.is_empty());
    }

    #[test]
    fn superseding_twice_is_not_found() {
        let conn = open_memory_database().unwrap();
        let def = glucose_definition(1, "70-100");
        insert_test_definition(&conn, &def).unwrap();
        mark_superseded(&conn, &def.id).unwrap();
        assert!(matches!(
            mark_superseded(&conn, &def.id),
            Err(DatabaseError::NotFound { .. })
        ));
    }
}
