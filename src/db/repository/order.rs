use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const DEFAULT_ORDER_LIMIT: u32 = 100;

const ORDER_SELECT: &str = "SELECT o.id, o.order_number, o.patient_id, o.test_definition_id,
            d.code, d.version, o.priority, o.ordering_clinician, o.status,
            o.collected_by, o.collected_at, o.sample_id, o.cancel_reason, o.version,
            o.ordered_at, o.updated_at, o.approved_at, o.turnaround_minutes
     FROM test_orders o
     JOIN test_definitions d ON d.id = o.test_definition_id";

pub fn insert_order(conn: &Connection, order: &TestOrder) -> Result<(), DatabaseError> {
    let (collected_by, collected_at) = collection_columns(order);
    conn.execute(
        "INSERT INTO test_orders (id, order_number, patient_id, test_definition_id, priority,
         ordering_clinician, status, collected_by, collected_at, sample_id, cancel_reason,
         version, ordered_at, updated_at, approved_at, turnaround_minutes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            order.id.to_string(),
            order.order_number,
            order.patient_id.to_string(),
            order.test_definition_id.to_string(),
            order.priority.as_str(),
            order.ordering_clinician,
            order.status.as_str(),
            collected_by,
            collected_at,
            order.sample_id,
            order.cancel_reason,
            order.version,
            format_timestamp(&order.ordered_at),
            format_timestamp(&order.updated_at),
            order.approved_at.as_ref().map(format_timestamp),
            order.turnaround_minutes,
        ],
    )?;
    Ok(())
}

pub fn get_order(conn: &Connection, id: &Uuid) -> Result<Option<TestOrder>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{ORDER_SELECT} WHERE o.id = ?1"),
            params![id.to_string()],
            order_row_from_rusqlite,
        )
        .optional()?;
    row.map(order_from_row).transpose()
}

/// Orders matching `filter`, most urgent first, then oldest first.
pub fn list_orders(conn: &Connection, filter: &OrderFilter) -> Result<Vec<TestOrder>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "{ORDER_SELECT}
         WHERE (?1 IS NULL OR o.patient_id = ?1)
           AND (?2 IS NULL OR o.status = ?2)
           AND (?3 IS NULL OR o.priority = ?3)
         ORDER BY CASE o.priority WHEN 'stat' THEN 0 WHEN 'urgent' THEN 1 ELSE 2 END,
                  o.ordered_at, o.order_number
         LIMIT ?4"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.patient_id.map(|id| id.to_string()),
            filter.status.map(|s| s.as_str()),
            filter.priority.map(|p| p.as_str()),
            filter.limit.unwrap_or(DEFAULT_ORDER_LIMIT),
        ],
        order_row_from_rusqlite,
    )?;

    let mut orders = Vec::new();
    for row in rows {
        orders.push(order_from_row(row?)?);
    }
    Ok(orders)
}

/// Persist the mutable columns of `order` if its stored version still equals
/// `order.version`. On success the in-memory version is bumped to match.
pub fn update_order(conn: &Connection, order: &mut TestOrder) -> Result<(), DatabaseError> {
    let (collected_by, collected_at) = collection_columns(order);
    let changed = conn.execute(
        "UPDATE test_orders SET status = ?3, collected_by = ?4, collected_at = ?5,
             sample_id = ?6, cancel_reason = ?7, updated_at = ?8, approved_at = ?9,
             turnaround_minutes = ?10, version = version + 1
         WHERE id = ?1 AND version = ?2",
        params![
            order.id.to_string(),
            order.version,
            order.status.as_str(),
            collected_by,
            collected_at,
            order.sample_id,
            order.cancel_reason,
            format_timestamp(&order.updated_at),
            order.approved_at.as_ref().map(format_timestamp),
            order.turnaround_minutes,
        ],
    )?;

    if changed == 0 {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM test_orders WHERE id = ?1)",
            params![order.id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DatabaseError::NotFound {
                entity_type: "TestOrder".into(),
                id: order.id.to_string(),
            });
        }
        return Err(DatabaseError::VersionConflict {
            entity_type: "TestOrder".into(),
            id: order.id.to_string(),
            expected: order.version,
        });
    }

    order.version += 1;
    Ok(())
}

pub fn insert_status_change(conn: &Connection, change: &StatusChange) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO order_status_history (order_id, from_status, to_status, actor, note, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            change.order_id.to_string(),
            change.from_status.map(|s| s.as_str()),
            change.to_status.as_str(),
            change.actor,
            change.note,
            format_timestamp(&change.changed_at),
        ],
    )?;
    Ok(())
}

/// Transitions of one order in the order they were recorded.
pub fn get_status_history(
    conn: &Connection,
    order_id: &Uuid,
) -> Result<Vec<StatusChange>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT from_status, to_status, actor, note, changed_at
         FROM order_status_history WHERE order_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![order_id.to_string()], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut history = Vec::new();
    for row in rows {
        let (from_status, to_status, actor, note, changed_at) = row?;
        history.push(StatusChange {
            order_id: *order_id,
            from_status: from_status.as_deref().map(OrderStatus::from_str).transpose()?,
            to_status: OrderStatus::from_str(&to_status)?,
            actor,
            note,
            changed_at: parse_timestamp(&changed_at)?,
        });
    }
    Ok(history)
}

pub fn count_orders_by_status(conn: &Connection) -> Result<Vec<(OrderStatus, i64)>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM test_orders GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts = Vec::new();
    for row in rows {
        let (status, count) = row?;
        counts.push((OrderStatus::from_str(&status)?, count));
    }
    Ok(counts)
}

/// Mean ordered-to-approved time over completed orders, in minutes.
pub fn average_turnaround_minutes(conn: &Connection) -> Result<Option<f64>, DatabaseError> {
    let avg = conn.query_row(
        "SELECT AVG(turnaround_minutes) FROM test_orders WHERE turnaround_minutes IS NOT NULL",
        [],
        |row| row.get::<_, Option<f64>>(0),
    )?;
    Ok(avg)
}

fn collection_columns(order: &TestOrder) -> (Option<&str>, Option<String>) {
    match &order.collection {
        Some(c) => (Some(c.collected_by.as_str()), Some(format_timestamp(&c.collected_at))),
        None => (None, None),
    }
}

// Internal row type for TestOrder mapping
struct OrderRow {
    id: String,
    order_number: String,
    patient_id: String,
    test_definition_id: String,
    test_code: String,
    definition_version: i64,
    priority: String,
    ordering_clinician: String,
    status: String,
    collected_by: Option<String>,
    collected_at: Option<String>,
    sample_id: Option<String>,
    cancel_reason: Option<String>,
    version: i64,
    ordered_at: String,
    updated_at: String,
    approved_at: Option<String>,
    turnaround_minutes: Option<i64>,
}

fn order_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<OrderRow, rusqlite::Error> {
    Ok(OrderRow {
        id: row.get(0)?,
        order_number: row.get(1)?,
        patient_id: row.get(2)?,
        test_definition_id: row.get(3)?,
        test_code: row.get(4)?,
        definition_version: row.get(5)?,
        priority: row.get(6)?,
        ordering_clinician: row.get(7)?,
        status: row.get(8)?,
        collected_by: row.get(9)?,
        collected_at: row.get(10)?,
        sample_id: row.get(11)?,
        cancel_reason: row.get(12)?,
        version: row.get(13)?,
        ordered_at: row.get(14)?,
        updated_at: row.get(15)?,
        approved_at: row.get(16)?,
        turnaround_minutes: row.get(17)?,
    })
}

fn order_from_row(row: OrderRow) -> Result<TestOrder, DatabaseError> {
    let collection = match (row.collected_by, row.collected_at) {
        (Some(collected_by), Some(at)) => Some(Collection {
            collected_by,
            collected_at: parse_timestamp(&at)?,
        }),
        _ => None,
    };
    Ok(TestOrder {
        id: parse_uuid(&row.id)?,
        order_number: row.order_number,
        patient_id: parse_uuid(&row.patient_id)?,
        test_definition_id: parse_uuid(&row.test_definition_id)?,
        test_code: row.test_code,
        definition_version: row.definition_version,
        priority: Priority::from_str(&row.priority)?,
        ordering_clinician: row.ordering_clinician,
        status: OrderStatus::from_str(&row.status)?,
        collection,
        sample_id: row.sample_id,
        cancel_reason: row.cancel_reason,
        version: row.version,
        ordered_at: parse_timestamp(&row.ordered_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        approved_at: parse_optional_timestamp(row.approved_at)?,
        turnaround_minutes: row.turnaround_minutes,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};

    use super::*;
    use crate::db::repository::{insert_patient, insert_test_definition};
    use crate::db::sqlite::open_memory_database;

    struct Fixture {
        patient_id: Uuid,
        definition_id: Uuid,
    }

    fn setup(conn: &Connection) -> Fixture {
        let now = Utc::now();
        let patient = Patient {
            id: Uuid::new_v4(),
            patient_number: "P000001".into(),
            first_name: "Asha".into(),
            last_name: "Verma".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            gender: Gender::Female,
            contact: ContactInfo {
                phone: "555-0101".into(),
                email: None,
                address: None,
            },
            status: PatientStatus::Active,
            created_at: now,
            updated_at: now,
        };
        insert_patient(conn, 1, &patient).unwrap();

        let definition = TestDefinition {
            id: Uuid::new_v4(),
            code: "CBC".into(),
            version: 1,
            name: "Complete Blood Count".into(),
            category: TestCategory::Hematology,
            sample_type: SampleType::Blood,
            is_current: true,
            parameters: vec![],
            created_by: "admin-1".into(),
            created_at: now,
        };
        insert_test_definition(conn, &definition).unwrap();

        Fixture {
            patient_id: patient.id,
            definition_id: definition.id,
        }
    }

    fn make_order(fx: &Fixture, number: &str, priority: Priority, offset_min: i64) -> TestOrder {
        let at = Utc::now() + Duration::minutes(offset_min);
        TestOrder {
            id: Uuid::new_v4(),
            order_number: number.into(),
            patient_id: fx.patient_id,
            test_definition_id: fx.definition_id,
            test_code: String::new(),
            definition_version: 0,
            priority,
            ordering_clinician: "dr-house".into(),
            status: OrderStatus::Ordered,
            collection: None,
            sample_id: None,
            cancel_reason: None,
            version: 1,
            ordered_at: at,
            updated_at: at,
            approved_at: None,
            turnaround_minutes: None,
        }
    }

    #[test]
    fn order_reads_back_with_definition_binding() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let order = make_order(&fx, "ORD000001", Priority::Routine, 0);
        insert_order(&conn, &order).unwrap();

        let fetched = get_order(&conn, &order.id).unwrap().unwrap();
        assert_eq!(fetched.test_code, "CBC");
        assert_eq!(fetched.definition_version, 1);
        assert_eq!(fetched.status, OrderStatus::Ordered);
        assert!(fetched.collection.is_none());
    }

    #[test]
    fn order_for_unknown_patient_violates_foreign_key() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let mut order = make_order(&fx, "ORD000001", Priority::Routine, 0);
        order.patient_id = Uuid::new_v4();
        assert!(insert_order(&conn, &order).is_err());
    }

    #[test]
    fn update_bumps_version_and_rejects_stale_writes() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let order = make_order(&fx, "ORD000001", Priority::Routine, 0);
        insert_order(&conn, &order).unwrap();

        let mut first = get_order(&conn, &order.id).unwrap().unwrap();
        let mut stale = first.clone();

        first.status = OrderStatus::Collected;
        first.collection = Some(Collection {
            collected_by: "nurse-1".into(),
            collected_at: Utc::now(),
        });
        first.sample_id = Some("BLO000001".into());
        update_order(&conn, &mut first).unwrap();
        assert_eq!(first.version, 2);

        stale.status = OrderStatus::Cancelled;
        let err = update_order(&conn, &mut stale).unwrap_err();
        assert!(matches!(err, DatabaseError::VersionConflict { expected: 1, .. }));

        let stored = get_order(&conn, &order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Collected);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.collection.unwrap().collected_by, "nurse-1");
    }

    #[test]
    fn update_of_missing_order_is_not_found() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let mut order = make_order(&fx, "ORD000001", Priority::Routine, 0);
        assert!(matches!(
            update_order(&conn, &mut order),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn listing_puts_stat_first() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        insert_order(&conn, &make_order(&fx, "ORD000001", Priority::Routine, 0)).unwrap();
        insert_order(&conn, &make_order(&fx, "ORD000002", Priority::Stat, 5)).unwrap();
        insert_order(&conn, &make_order(&fx, "ORD000003", Priority::Urgent, 1)).unwrap();

        let orders = list_orders(&conn, &OrderFilter::default()).unwrap();
        let numbers: Vec<_> = orders.iter().map(|o| o.order_number.as_str()).collect();
        assert_eq!(numbers, vec!["ORD000002", "ORD000003", "ORD000001"]);

        let stat_only = list_orders(
            &conn,
            &OrderFilter { priority: Some(Priority::Stat), ..Default::default() },
        )
        .unwrap();
        assert_eq!(stat_only.len(), 1);
    }

    #[test]
    fn history_keeps_insertion_order() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let order = make_order(&fx, "ORD000001", Priority::Routine, 0);
        insert_order(&conn, &order).unwrap();

        for (from, to) in [
            (None, OrderStatus::Ordered),
            (Some(OrderStatus::Ordered), OrderStatus::Collected),
        ] {
            insert_status_change(
                &conn,
                &StatusChange {
                    order_id: order.id,
                    from_status: from,
                    to_status: to,
                    actor: "nurse-1".into(),
                    note: None,
                    changed_at: Utc::now(),
                },
            )
            .unwrap();
        }

        let history = get_status_history(&conn, &order.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_status, None);
        assert_eq!(history[1].to_status, OrderStatus::Collected);
    }

    #[test]
    fn stats_aggregate_status_and_turnaround() {
        let conn = open_memory_database().unwrap();
        let fx = setup(&conn);
        let mut a = make_order(&fx, "ORD000001", Priority::Routine, 0);
        a.status = OrderStatus::Approved;
        a.turnaround_minutes = Some(30);
        let mut b = make_order(&fx, "ORD000002", Priority::Routine, 0);
        b.status = OrderStatus::Approved;
        b.turnaround_minutes = Some(90);
        let c = make_order(&fx, "ORD000003", Priority::Routine, 0);
        for order in [&a, &b, &c] {
            insert_order(&conn, order).unwrap();
        }

        let counts = count_orders_by_status(&conn).unwrap();
        assert!(counts.contains(&(OrderStatus::Approved, 2)));
        assert!(counts.contains(&(OrderStatus::Ordered, 1)));
        assert_eq!(average_turnaround_minutes(&conn).unwrap(), Some(60.0));
    }

    #[test]
    fn no_completed_orders_means_no_average() {
        let conn = open_memory_database().unwrap();
        assert_eq!(average_turnaround_minutes(&conn).unwrap(), None);
    }
}
