//! Dirty checking, statement ordering, and failure handling of flushes.

mod common;

use common::{Fixture, text};
use persist::prelude::*;
use persist::session::ActionKind;

#[test]
fn test_update_writes_only_changed_columns() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ada = session.find("Employee", 100_i64).unwrap().unwrap();
    fx.db.clear_log();

    ada.set_value("name", "Ada L.").unwrap();
    let result = session.flush().unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.total(), 1);
    assert_eq!(
        fx.db.statement_log(),
        vec![r#"UPDATE "employee" SET "name" = ?1 WHERE "id" = ?2"#.to_string()]
    );
    assert_eq!(fx.column("employee", 100, "name"), Some(text("Ada L.")));

    // The snapshot now matches.
    assert_eq!(session.flush().unwrap().total(), 0);
    assert_eq!(fx.db.write_count(), 1);
}

#[test]
fn test_plan_flush_reports_changed_columns() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let bob = session.find("Employee", 101_i64).unwrap().unwrap();
    let ops = session.find("Department", 2_i64).unwrap().unwrap();

    bob.set_reference("department", Some(&ops)).unwrap();
    let plan = session.plan_flush().unwrap();

    assert_eq!(plan.queue().len(), 1);
    let action = plan.queue().iter().next().unwrap();
    assert_eq!(action.kind(), ActionKind::Update);
    assert_eq!(action.changes().len(), 1);
    assert_eq!(action.changes()[0].column, "department_id");
    assert_eq!(action.changes()[0].old, Value::BigInt(1));
    assert_eq!(action.changes()[0].new, Value::BigInt(2));
    // Planning writes nothing.
    assert_eq!(fx.db.write_count(), 0);
}

#[test]
fn test_versioned_update_increments_the_version() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    fx.db.clear_log();

    eng.set_value("name", "Engineering").unwrap();
    session.flush().unwrap();

    assert_eq!(
        fx.db.statement_log(),
        vec![
            r#"UPDATE "department" SET "name" = ?1, "version" = ?2 WHERE "id" = ?3 AND "version" = ?4"#
                .to_string()
        ]
    );
    assert_eq!(fx.column("department", 1, "version"), Some(Value::BigInt(1)));
    assert_eq!(eng.value("version").unwrap(), Value::BigInt(1));
    assert_eq!(session.entry(&eng).unwrap().version(), Some(&Value::BigInt(1)));
}

#[test]
fn test_concurrent_update_is_stale() {
    let fx = Fixture::new();
    let mut first = fx.session();
    let mut second = fx.session();
    let mine = first.find("Department", 1_i64).unwrap().unwrap();
    let theirs = second.find("Department", 1_i64).unwrap().unwrap();

    mine.set_value("name", "Mine").unwrap();
    first.flush().unwrap();

    theirs.set_value("name", "Theirs").unwrap();
    let err = second.flush().unwrap_err();
    match err {
        Error::StaleState {
            entity,
            id,
            expected_version,
        } => {
            assert_eq!(entity, "Department");
            assert_eq!(id, Value::BigInt(1));
            assert_eq!(expected_version, Some(Value::BigInt(0)));
        }
        other => panic!("expected stale state, got {other:?}"),
    }

    assert!(second.is_failed());
    assert!(matches!(
        second.find("Department", 2_i64),
        Err(Error::UnitOfWorkFailed)
    ));
    assert!(matches!(second.flush(), Err(Error::UnitOfWorkFailed)));
    assert_eq!(fx.column("department", 1, "name"), Some(text("Mine")));
}

#[test]
fn test_inserts_follow_foreign_keys() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let research = EntityRef::new("Department")
        .with_id(3_i64)
        .with_value("name", "Research");
    let dee = EntityRef::new("Employee")
        .with_value("name", "Dee")
        .with_reference("department", Some(&research));

    // Persisted child first, parent second.
    session.persist(&dee).unwrap();
    session.persist(&research).unwrap();
    assert_eq!(dee.id(), Some(Value::BigInt(103)));

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 2);

    let log = fx.db.statement_log();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with(r#"INSERT INTO "department""#), "{log:?}");
    assert!(log[1].starts_with(r#"INSERT INTO "employee""#), "{log:?}");
    assert_eq!(fx.column("employee", 103, "department_id"), Some(Value::BigInt(3)));
    assert_eq!(fx.column("department", 3, "version"), Some(Value::BigInt(0)));
    assert_eq!(research.value("version").unwrap(), Value::BigInt(0));
}

#[test]
fn test_transient_reference_leaves_the_session_usable() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let research = EntityRef::new("Department")
        .with_id(3_i64)
        .with_value("name", "Research");
    let dee = EntityRef::new("Employee")
        .with_value("name", "Dee")
        .with_reference("department", Some(&research));
    session.persist(&dee).unwrap();

    let err = session.flush().unwrap_err();
    assert!(matches!(
        err,
        Error::TransientReference { ref attribute, .. } if attribute == "department"
    ));
    assert!(!session.is_failed());
    assert_eq!(fx.db.write_count(), 0);

    session.persist(&research).unwrap();
    assert_eq!(session.flush().unwrap().inserted, 2);
}

#[test]
fn test_failed_write_poisons_the_session() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ada = session.find("Employee", 100_i64).unwrap().unwrap();
    ada.set_value("name", "Ada L.").unwrap();

    fx.db.fail_next_write(Error::Connectivity("connection reset".into()));
    assert!(matches!(session.flush(), Err(Error::Connectivity(_))));
    assert!(session.is_failed());
    assert!(matches!(session.flush(), Err(Error::UnitOfWorkFailed)));
    assert_eq!(fx.column("employee", 100, "name"), Some(text("Ada")));
}

#[test]
fn test_duplicate_keys_are_rejected() {
    let fx = Fixture::new();
    let duplicate = EntityRef::new("Department")
        .with_id(1_i64)
        .with_value("name", "Again");

    // A second instance for a managed key counts as detached.
    let mut session = fx.session();
    session.find("Department", 1_i64).unwrap().unwrap();
    assert!(matches!(
        session.persist(&duplicate),
        Err(Error::InvalidState(_))
    ));
    assert!(!session.is_failed());

    // Caught by the database otherwise.
    let mut other = fx.session();
    other.persist(&duplicate).unwrap();
    let err = other.flush().unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }));
    assert!(other.is_failed());
}

#[test]
fn test_join_table_links_follow_the_collection() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let bob = session.find("Employee", 101_i64).unwrap().unwrap();
    let projects = bob.get_collection(&mut session, "projects").unwrap();
    assert_eq!(projects.len(), 1);
    let apollo = projects[0].clone();

    assert!(bob.remove_element("projects", &apollo).unwrap());
    let result = session.flush().unwrap();
    assert_eq!(result.collection_actions, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(fx.db.row_count("employee_project"), 1);

    // Persist cascades from the managed owner to the new project.
    let titan = EntityRef::new("Project")
        .with_id(501_i64)
        .with_value("title", "Titan");
    bob.add_element("projects", &titan).unwrap();
    bob.add_element("projects", &apollo).unwrap();
    session.persist(&bob).unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.collection_actions, 2);
    assert_eq!(fx.db.row_count("employee_project"), 3);

    let mut other = fx.session();
    let bob = other.find("Employee", 101_i64).unwrap().unwrap();
    let mut titles: Vec<Value> = bob
        .get_collection(&mut other, "projects")
        .unwrap()
        .iter()
        .map(|p| p.value("title").unwrap())
        .collect();
    titles.sort_by_key(ToString::to_string);
    assert_eq!(titles, vec![text("Apollo"), text("Titan")]);
}

#[test]
fn test_deletes_run_children_first() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ops = session.find("Department", 2_i64).unwrap().unwrap();
    fx.db.clear_log();

    // Cascades to Cy through `employees`.
    session.remove(&ops).unwrap();
    let result = session.flush().unwrap();

    assert_eq!(result.deleted, 2);
    let writes: Vec<String> = fx
        .db
        .statement_log()
        .into_iter()
        .filter(|sql| sql.starts_with("DELETE"))
        .collect();
    assert_eq!(writes.len(), 3);
    assert!(writes[0].starts_with(r#"DELETE FROM "employee_project""#), "{writes:?}");
    assert!(writes[1].starts_with(r#"DELETE FROM "employee""#), "{writes:?}");
    assert!(writes[2].starts_with(r#"DELETE FROM "department""#), "{writes:?}");
    assert_eq!(fx.db.row_count("employee"), 2);
    assert_eq!(fx.db.row_count("department"), 1);
    assert!(!session.contains(&ops));
}

#[test]
fn test_flush_callbacks_run_around_the_writes() {
    use std::sync::{Arc, Mutex};

    let fx = Fixture::new();
    let mut session = fx.session();
    let events = Arc::new(Mutex::new(Vec::new()));
    let before = Arc::clone(&events);
    session.on_before_flush(move || {
        before.lock().unwrap().push("before");
        Ok(())
    });
    let after = Arc::clone(&events);
    session.on_after_flush(move || {
        after.lock().unwrap().push("after");
        Ok(())
    });

    session.flush().unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["before", "after"]);
    assert_eq!(session.statistics().flushes, 1);
}

#[test]
fn test_planning_scales_to_thousands_of_inserts() {
    use std::time::{Duration, Instant};

    let fx = Fixture::new();
    let mut session = fx.session();
    let research = EntityRef::new("Department")
        .with_id(3_i64)
        .with_value("name", "Research");

    // Referencing rows first, so every one of them waits on the department.
    let staff: Vec<EntityRef> = (0..3000)
        .map(|i| {
            EntityRef::new("Employee")
                .with_value("name", format!("e{i}"))
                .with_reference("department", Some(&research))
        })
        .collect();
    for employee in &staff {
        session.persist(employee).unwrap();
    }
    session.persist(&research).unwrap();

    let started = Instant::now();
    let plan = session.plan_flush().unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(5), "planning took {elapsed:?}");

    assert_eq!(plan.queue().len(), 3001);
    let first = plan.queue().iter().next().unwrap();
    assert_eq!(first.kind(), ActionKind::Insert);
    assert_eq!(first.target().key().entity(), "Department");

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 3001);
    assert_eq!(fx.db.row_count("employee"), 3003);
}

#[test]
fn test_detached_targets_keep_their_foreign_key() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ada = session.find("Employee", 100_i64).unwrap().unwrap();
    let eng = ada.reference("department").unwrap().unwrap();

    session.evict(&eng).unwrap();
    assert!(!session.contains(&eng));
    ada.set_value("name", "Ada L.").unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(fx.column("employee", 100, "department_id"), Some(Value::BigInt(1)));

    // Read by another unit of work, so never managed by this one.
    let ops = fx.session().find("Department", 2_i64).unwrap().unwrap();
    ada.set_reference("department", Some(&ops)).unwrap();
    assert_eq!(session.flush().unwrap().updated, 1);
    assert_eq!(fx.column("employee", 100, "department_id"), Some(Value::BigInt(2)));
}

#[test]
fn test_failed_after_flush_callback_poisons_the_session() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ada = session.find("Employee", 100_i64).unwrap().unwrap();
    session.on_after_flush(|| Err(Error::InvalidState("audit log unavailable".into())));

    ada.set_value("name", "Ada L.").unwrap();
    assert!(matches!(session.flush(), Err(Error::InvalidState(_))));

    // The writes went out before the callback ran.
    assert_eq!(fx.column("employee", 100, "name"), Some(text("Ada L.")));
    assert_eq!(session.statistics().flushes, 1);
    assert!(session.is_failed());
    assert!(matches!(session.flush(), Err(Error::UnitOfWorkFailed)));
}
