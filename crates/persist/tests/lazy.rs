//! Placeholders, lazy collections, entity graphs, and load types.

mod common;

use common::{Fixture, text};
use persist::prelude::*;
use persist::{LazyLoadStats, NavigableRole};

fn graph(fx: &Fixture, entity: &str, attributes: &[&str]) -> RootGraph {
    let mut graph = RootGraph::new(None, entity);
    graph
        .add_attribute_nodes(fx.metamodel.as_ref(), attributes)
        .unwrap();
    graph
}

#[test]
fn test_fetch_graph_leaves_unnamed_associations_lazy() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let options = LoadOptions::default().fetch_graph(graph(&fx, "Employee", &["name"]));

    let ada = session.load_with("Employee", 100_i64, &options).unwrap().unwrap();

    // `department` is mapped eager but the graph does not name it.
    let department = ada.reference("department").unwrap().unwrap();
    assert!(!department.is_initialized());
    assert_eq!(fx.db.load_count(), 1);

    assert_eq!(department.get(&mut session, "name").unwrap(), text("Eng"));
    assert_eq!(fx.db.load_count(), 2);
}

#[test]
fn test_load_graph_keeps_mapping_defaults() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let options = LoadOptions::default().load_graph(graph(&fx, "Employee", &["name"]));

    let ada = session.load_with("Employee", 100_i64, &options).unwrap().unwrap();

    let department = ada.reference("department").unwrap().unwrap();
    assert!(department.is_initialized());
    assert_eq!(fx.db.load_count(), 2);
}

#[test]
fn test_graph_makes_lazy_associations_eager() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let options = LoadOptions::default().load_graph(graph(&fx, "Employee", &["manager"]));

    let bob = session.load_with("Employee", 101_i64, &options).unwrap().unwrap();

    let manager = bob.reference("manager").unwrap().unwrap();
    assert!(manager.is_initialized());
    assert_eq!(manager.value("name").unwrap(), text("Ada"));
}

#[test]
fn test_hint_names_select_the_semantic() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let options = LoadOptions::default()
        .with_hint("jakarta.persistence.fetchgraph", graph(&fx, "Employee", &["name"]))
        .unwrap();
    let cy = session.load_with("Employee", 102_i64, &options).unwrap().unwrap();
    assert!(!cy.reference("department").unwrap().unwrap().is_initialized());

    let err = LoadOptions::default()
        .with_hint("javax.persistence.somegraph", graph(&fx, "Employee", &["name"]))
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_placeholders_are_transparent() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let bob = session.find("Employee", 101_i64).unwrap().unwrap();
    let manager = bob.reference("manager").unwrap().unwrap();

    // The identifier is known without a load.
    assert_eq!(manager.id(), Some(Value::BigInt(100)));
    assert_eq!(manager.entity_name(), "Employee");
    assert!(matches!(
        manager.value("name"),
        Err(Error::LazyInitialization { .. })
    ));
    let loads = fx.db.load_count();

    assert_eq!(manager.get(&mut session, "name").unwrap(), text("Ada"));
    assert_eq!(fx.db.load_count(), loads + 1);
    assert_eq!(manager.value("name").unwrap(), text("Ada"));

    // Writes through the placeholder reach the managed instance.
    manager.set(&mut session, "name", Value::from("Ada L.")).unwrap();
    assert_eq!(session.flush().unwrap().updated, 1);
    assert_eq!(fx.column("employee", 100, "name"), Some(text("Ada L.")));
}

#[test]
fn test_lazy_collections_load_on_first_access() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();

    assert!(!eng.is_attribute_initialized("employees"));
    assert!(matches!(
        eng.elements("employees"),
        Err(Error::LazyInitialization { .. })
    ));

    let employees = eng.get_collection(&mut session, "employees").unwrap();
    let mut names: Vec<Value> = employees.iter().map(|e| e.value("name").unwrap()).collect();
    names.sort_by_key(ToString::to_string);
    assert_eq!(names, vec![text("Ada"), text("Bob")]);
    assert!(eng.is_attribute_initialized("employees"));
    assert_eq!(session.statistics().collection_loads, 1);

    // Elements share identity with other loads.
    let ada = session.find("Employee", 100_i64).unwrap().unwrap();
    assert!(employees.iter().any(|e| EntityRef::ptr_eq(e, &ada)));

    assert_eq!(
        session.lazy_load_stats(),
        LazyLoadStats {
            total_loads: 1,
            roles_loaded: 1,
            potential_n1: 0,
        }
    );
}

#[test]
fn test_fetch_graph_loads_collections_up_front() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let options = LoadOptions::default().fetch_graph(graph(&fx, "Department", &["employees"]));

    let eng = session.load_with("Department", 1_i64, &options).unwrap().unwrap();

    assert!(eng.is_attribute_initialized("employees"));
    assert_eq!(eng.elements("employees").unwrap().len(), 2);
    assert_eq!(fx.db.load_count(), 2);
    assert_eq!(session.lazy_load_stats().total_loads, 0);
}

#[test]
fn test_repeated_lazy_loads_are_reported() {
    let fx = Fixture::new();
    let config = SessionConfig::default().with_lazy_load_warn_threshold(2);
    let mut session = Session::with_config(fx.metamodel.clone(), fx.db.clone(), config).unwrap();

    let staff = session
        .multi_load("Employee", [100_i64, 101, 102], &LoadOptions::default())
        .unwrap();
    for employee in &staff {
        employee.get_collection(&mut session, "projects").unwrap();
    }

    let stats = session.lazy_load_stats();
    assert_eq!(stats.total_loads, 3);
    assert_eq!(stats.roles_loaded, 1);
    assert_eq!(stats.potential_n1, 1);

    session.clear();
    assert_eq!(session.lazy_load_stats(), LazyLoadStats::default());
}

#[test]
fn test_load_types() {
    let fx = Fixture::new();
    assert_eq!(LoadType::ALL.len(), 7);

    let mut session = fx.session();
    let lazy = session
        .load_with("Employee", 100_i64, &LoadOptions::new(&LoadType::INTERNAL_LOAD_LAZY))
        .unwrap()
        .unwrap();
    assert!(!lazy.is_initialized());
    assert_eq!(fx.db.load_count(), 0);

    // Locking a placeholder request needs the row.
    let locked = session
        .load_with(
            "Employee",
            102_i64,
            &LoadOptions::new(&LoadType::LOAD).with_lock(LockMode::PessimisticRead),
        )
        .unwrap()
        .unwrap();
    assert!(locked.is_initialized());

    assert!(
        session
            .load_with("Employee", 999_i64, &LoadOptions::new(&LoadType::INTERNAL_LOAD_NULLABLE))
            .unwrap()
            .is_none()
    );
    assert!(
        session
            .load_with("Employee", 999_i64, &LoadOptions::new(&LoadType::LOAD))
            .unwrap()
            .is_some()
    );

    // Immediate loads return the placeholder's instance, initialized.
    let ada = session
        .load_with("Employee", 100_i64, &LoadOptions::new(&LoadType::IMMEDIATE_LOAD))
        .unwrap()
        .unwrap();
    assert!(EntityRef::ptr_eq(&ada, &lazy));
    assert!(lazy.is_initialized());
}

#[test]
fn test_reload_overwrites_local_changes() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let eng = session.find("Department", 1_i64).unwrap().unwrap();
    eng.set_value("name", "Local").unwrap();

    let reloaded = session
        .load_with("Department", 1_i64, &LoadOptions::new(&LoadType::RELOAD))
        .unwrap()
        .unwrap();
    assert!(EntityRef::ptr_eq(&eng, &reloaded));
    assert_eq!(eng.value("name").unwrap(), text("Eng"));
    assert_eq!(session.flush().unwrap().total(), 0);
}

#[test]
fn test_lazy_loads_are_counted_per_association() {
    let fx = Fixture::new();
    let mut session = fx.session();
    let bob = session.find("Employee", 101_i64).unwrap().unwrap();
    let manager = bob.reference("manager").unwrap().unwrap();
    manager.get(&mut session, "name").unwrap();

    let manager_role = NavigableRole::new("Employee").append("manager");
    assert_eq!(session.lazy_loads_of(&manager_role), 1);
    assert_eq!(session.lazy_loads_of(&NavigableRole::new("Employee")), 0);

    // Placeholders asked for directly have no owning association.
    let cy = session.get_reference("Employee", 102_i64).unwrap();
    cy.get(&mut session, "name").unwrap();
    assert_eq!(session.lazy_loads_of(&NavigableRole::new("Employee")), 1);
    assert_eq!(session.lazy_load_stats().roles_loaded, 2);
}
