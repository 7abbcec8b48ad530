//! Cascading entity operations across associations.

mod common;

use common::{Fixture, text};
use persist::prelude::*;

#[test]
fn test_persist_cascades_through_the_graph() {
    let fx = Fixture::new();
    let mut session = fx.session();

    let gemini = EntityRef::new("Project").with_id(600_i64).with_value("title", "Gemini");
    let labs = EntityRef::new("Department").with_id(5_i64).with_value("name", "Labs");
    let eve = EntityRef::new("Employee")
        .with_value("name", "Eve")
        .with_reference("department", Some(&labs))
        .with_elements("projects", vec![gemini.clone()]);
    labs.add_element("employees", &eve).unwrap();

    session.persist(&labs).unwrap();
    assert!(session.contains(&eve));
    assert!(session.contains(&gemini));

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 3);
    assert_eq!(result.collection_actions, 1);

    // Read back in a fresh unit of work.
    let mut other = fx.session();
    let eve_id = eve.id().unwrap();
    let loaded = other.find("Employee", eve_id).unwrap().unwrap();
    let department = loaded.reference("department").unwrap().unwrap();
    assert_eq!(department.value("name").unwrap(), text("Labs"));
    let projects = loaded.get_collection(&mut other, "projects").unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].value("title").unwrap(), text("Gemini"));
}

#[test]
fn test_persist_rejects_detached_instances() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    session.detach(&eng).unwrap();

    assert!(!session.contains(&eng));
    session.find("Department", 1_i64).unwrap().unwrap();
    assert!(matches!(session.persist(&eng), Err(Error::InvalidState(_))));
    assert!(matches!(session.remove(&eng), Err(Error::InvalidState(_))));
}

#[test]
fn test_remove_cascades_to_lazy_collections() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    assert!(!eng.is_attribute_initialized("employees"));

    session.remove(&eng).unwrap();
    let result = session.flush().unwrap();

    // Ada and Bob go with their department; Bob first since he references Ada.
    assert_eq!(result.deleted, 3);
    assert_eq!(result.collection_actions, 2);
    assert_eq!(fx.db.row_count("employee"), 1);
    assert_eq!(fx.db.row_count("employee_project"), 0);
    assert_eq!(fx.db.row_count("department"), 1);
    assert_eq!(fx.db.row_count("project"), 1);
}

#[test]
fn test_persist_cancels_a_pending_remove() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let cy = session.find("Employee", 102_i64).unwrap().unwrap();

    session.remove(&cy).unwrap();
    session.persist(&cy).unwrap();
    assert_eq!(session.flush().unwrap().total(), 0);
    assert_eq!(fx.db.row_count("employee"), 3);
}

#[test]
fn test_merge_copies_a_detached_graph() {
    let fx = Fixture::new();
    let mut first = fx.session();
    let eng = first.find("Department", 1_i64).unwrap().unwrap();
    eng.get_collection(&mut first, "employees").unwrap();
    first.clear();

    eng.set_value("name", "Engineering").unwrap();

    let mut second = fx.session();
    let managed = second.merge(&eng).unwrap();
    assert!(!EntityRef::ptr_eq(&managed, &eng));
    assert!(!second.contains(&eng));
    assert_eq!(managed.value("name").unwrap(), text("Engineering"));

    // Employees were merged too and point at the managed department.
    let employees = managed.elements("employees").unwrap();
    assert_eq!(employees.len(), 2);
    for employee in &employees {
        assert!(second.contains(employee));
        let department = employee.reference("department").unwrap().unwrap();
        assert!(EntityRef::ptr_eq(&department, &managed));
    }

    let result = second.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(fx.column("department", 1, "name"), Some(text("Engineering")));
    assert_eq!(fx.column("department", 1, "version"), Some(Value::BigInt(1)));
}

#[test]
fn test_merge_detects_concurrent_changes() {
    let fx = Fixture::new();
    let mut first = fx.session();
    let eng = first.find("Department", 1_i64).unwrap().unwrap();
    first.clear();

    let mut meanwhile = fx.session();
    let current = meanwhile.find("Department", 1_i64).unwrap().unwrap();
    current.set_value("name", "Renamed").unwrap();
    meanwhile.flush().unwrap();

    let mut second = fx.session();
    let err = second.merge(&eng).unwrap_err();
    assert!(matches!(
        err,
        Error::StaleState { expected_version: Some(Value::BigInt(0)), .. }
    ));
}

#[test]
fn test_merge_of_a_new_instance_persists_a_copy() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let sales = EntityRef::new("Department").with_id(4_i64).with_value("name", "Sales");

    let managed = session.merge(&sales).unwrap();
    assert!(!EntityRef::ptr_eq(&managed, &sales));
    assert!(session.contains(&managed));
    assert!(!session.contains(&sales));

    assert_eq!(session.flush().unwrap().inserted, 1);
    assert_eq!(fx.column("department", 4, "name"), Some(text("Sales")));
}

#[test]
fn test_refresh_discards_local_changes() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    eng.set_value("name", "Local").unwrap();

    let mut other = fx.session();
    let remote = other.find("Department", 1_i64).unwrap().unwrap();
    remote.set_value("name", "Remote").unwrap();
    other.flush().unwrap();

    session.refresh(&eng).unwrap();
    assert_eq!(eng.value("name").unwrap(), text("Remote"));
    assert_eq!(eng.value("version").unwrap(), Value::BigInt(1));
    assert_eq!(session.flush().unwrap().total(), 0);

    let stranger = EntityRef::new("Department").with_id(9_i64);
    assert!(matches!(session.refresh(&stranger), Err(Error::InvalidState(_))));
}

#[test]
fn test_detach_cascades_to_loaded_collections() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    let employees = eng.get_collection(&mut session, "employees").unwrap();

    session.detach(&eng).unwrap();
    assert!(!session.contains(&eng));
    assert!(employees.iter().all(|e| !session.contains(e)));

    eng.set_value("name", "Ignored").unwrap();
    assert_eq!(session.flush().unwrap().total(), 0);

    let again = session.find("Department", 1_i64).unwrap().unwrap();
    assert!(!EntityRef::ptr_eq(&again, &eng));
    assert_eq!(again.value("name").unwrap(), text("Eng"));
}

#[test]
fn test_pessimistic_lock_rereads_the_row() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    let loads = fx.db.load_count();

    session.lock(&eng, LockMode::PessimisticWrite).unwrap();
    assert_eq!(fx.db.load_count(), loads + 1);
    assert_eq!(session.entry(&eng).unwrap().lock_mode(), LockMode::PessimisticWrite);

    // A weaker mode is already covered.
    session.lock(&eng, LockMode::Read).unwrap();
    assert_eq!(fx.db.load_count(), loads + 1);
}

#[test]
fn test_lock_reports_a_stale_version() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ops = session.find("Department", 2_i64).unwrap().unwrap();

    let mut other = fx.session();
    let remote = other.find("Department", 2_i64).unwrap().unwrap();
    remote.set_value("name", "Operations").unwrap();
    other.flush().unwrap();

    let err = session.lock(&ops, LockMode::PessimisticRead).unwrap_err();
    assert!(matches!(err, Error::StaleState { .. }));
}

#[test]
fn test_force_increment_bumps_an_unchanged_version() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let ops = session.find("Department", 2_i64).unwrap().unwrap();

    session.lock(&ops, LockMode::OptimisticForceIncrement).unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(fx.column("department", 2, "version"), Some(Value::BigInt(1)));

    // The increment happens once.
    assert_eq!(session.flush().unwrap().total(), 0);
}
