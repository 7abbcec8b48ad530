//! Shared model and data for integration tests.
#![allow(dead_code)]

use persist::prelude::*;
use persist::{Row, SecondLevelCache};
use std::sync::{Arc, Once};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Departments own employees; employees work on projects.
///
/// - `Department`: versioned, cacheable, `employees` cascades everything
/// - `Employee`: generated ids, eager `department`, lazy `manager`,
///   `projects` through `employee_project` cascading persist
/// - `Project`: inverse side of `projects`
pub fn metamodel() -> Arc<Metamodel> {
    let department = EntityDescriptor::new(
        "Department",
        "department",
        AttributeDescriptor::basic("id", SqlType::BigInt),
    )
    .attribute(AttributeDescriptor::basic("name", SqlType::Text))
    .attribute(
        AttributeDescriptor::one_to_many("employees", "Employee", "department")
            .cascade(CascadeStyle::ALL),
    )
    .version(AttributeDescriptor::basic("version", SqlType::BigInt))
    .cacheable(true);

    let employee = EntityDescriptor::new(
        "Employee",
        "employee",
        AttributeDescriptor::basic("id", SqlType::BigInt),
    )
    .generated_id()
    .attribute(AttributeDescriptor::basic("name", SqlType::Text))
    .attribute(AttributeDescriptor::to_one("department", "Department", "department_id").nullable(false))
    .attribute(AttributeDescriptor::to_one("manager", "Employee", "manager_id").lazy())
    .attribute(
        AttributeDescriptor::many_to_many(
            "projects",
            "Project",
            JoinTable::new("employee_project", "employee_id", "project_id"),
        )
        .cascade(CascadeStyle::of(CascadeOp::Persist)),
    );

    let project = EntityDescriptor::new(
        "Project",
        "project",
        AttributeDescriptor::basic("id", SqlType::BigInt),
    )
    .attribute(AttributeDescriptor::basic("title", SqlType::Text))
    .attribute(AttributeDescriptor::many_to_many_inverse("members", "Employee", "projects"));

    Arc::new(
        Metamodel::builder()
            .entity(department)
            .entity(employee)
            .entity(project)
            .build()
            .expect("valid metamodel"),
    )
}

fn department(id: i64, name: &str) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("name", Value::from(name)),
        ("version", Value::BigInt(0)),
    ])
}

fn employee(id: i64, name: &str, department: i64, manager: Option<i64>) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("name", Value::from(name)),
        ("department_id", Value::BigInt(department)),
        ("manager_id", manager.map_or(Value::Null, Value::BigInt)),
    ])
}

/// A seeded database and the model it was built from.
///
/// | department | employee                 | project      |
/// |------------|--------------------------|--------------|
/// | 1 Eng      | 100 Ada (1)              | 500 Apollo   |
/// | 2 Ops      | 101 Bob (1, mgr 100)     |              |
/// |            | 102 Cy  (2)              |              |
///
/// Ada and Bob work on Apollo.
pub struct Fixture {
    pub metamodel: Arc<Metamodel>,
    pub db: MemoryDatabase,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let metamodel = metamodel();
        let db = MemoryDatabase::new(metamodel.as_ref()).expect("tables");
        db.seed("department", [department(1, "Eng"), department(2, "Ops")])
            .expect("departments");
        db.seed(
            "employee",
            [
                employee(100, "Ada", 1, None),
                employee(101, "Bob", 1, Some(100)),
                employee(102, "Cy", 2, None),
            ],
        )
        .expect("employees");
        db.seed(
            "project",
            [Row::from_pairs([("id", Value::BigInt(500)), ("title", Value::from("Apollo"))])],
        )
        .expect("projects");
        db.seed(
            "employee_project",
            [100, 101].map(|e| {
                Row::from_pairs([
                    ("employee_id", Value::BigInt(e)),
                    ("project_id", Value::BigInt(500)),
                ])
            }),
        )
        .expect("links");
        Self { metamodel, db }
    }

    pub fn session(&self) -> Session<MemoryDatabase> {
        Session::new(self.metamodel.clone(), self.db.clone())
    }

    pub fn session_with_cache(&self, cache: Arc<dyn SecondLevelCache>) -> Session<MemoryDatabase> {
        self.session().with_cache(cache)
    }

    /// Value of `column` in the row of `table` with `id`.
    pub fn column(&self, table: &str, id: i64, column: &str) -> Option<Value> {
        self.db
            .find_row(table, "id", &Value::BigInt(id))
            .and_then(|row| row.get_by_name(column).cloned())
    }
}

pub fn text(value: &str) -> Value {
    Value::from(value)
}
