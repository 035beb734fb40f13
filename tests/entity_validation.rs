use std::sync::Arc;

use entity_store::context::StaticContext;
use entity_store::datatype::{PropertyType, Value};
use entity_store::declaration::{EntityTypeDeclaration, PropertyDeclaration};
use entity_store::module::DeclarativeModule;
use entity_store::persist::PersistenceMode;
use entity_store::registry::EntityRegistry;
use entity_store::{Entity, EntityError};
use serde_json::{json, Value as JsonValue};

fn everything() -> EntityTypeDeclaration {
    EntityTypeDeclaration::new("sample", "Sample")
        .property(PropertyDeclaration::new("text", PropertyType::Text))
        .property(PropertyDeclaration::new("long_text", PropertyType::LongText))
        .property(PropertyDeclaration::new("email", PropertyType::Email))
        .property(PropertyDeclaration::new("integer", PropertyType::Integer))
        .property(PropertyDeclaration::new("date", PropertyType::Date))
        .property(PropertyDeclaration::new("boolean", PropertyType::Boolean))
        .property(PropertyDeclaration::new("price", PropertyType::Price))
        .property(PropertyDeclaration::new("user", PropertyType::User))
        .property(PropertyDeclaration::new("project", PropertyType::Project))
        .property(PropertyDeclaration::new("record", PropertyType::Record))
        .property(PropertyDeclaration::new("json", PropertyType::Json))
        .property(PropertyDeclaration::new("color", PropertyType::Text).choices([("red", "Red"), ("blue", "Blue")]))
        .property(PropertyDeclaration::new("level", PropertyType::Integer).choices([("1", "Low"), ("2", "High")]))
        .property(PropertyDeclaration::new("name", PropertyType::Text).required())
}

fn setup_with(context: StaticContext) -> EntityRegistry {
    let registry = EntityRegistry::new(PersistenceMode::InMemory, Arc::new(context)).expect("registry");
    let company = EntityTypeDeclaration::new("company", "Company")
        .property(PropertyDeclaration::new("name", PropertyType::Text).required())
        .property(PropertyDeclaration::new("ceo", PropertyType::EntityReference).references("person"))
        .label_key("name");
    let person = EntityTypeDeclaration::new("person", "Person")
        .property(PropertyDeclaration::new("name", PropertyType::Text).required())
        .property(PropertyDeclaration::new("employer", PropertyType::EntityReference).references("company"))
        .property(
            PropertyDeclaration::new("boards", PropertyType::EntityReference)
                .references("company")
                .multiple(),
        )
        .label_key("name");
    let committee = EntityTypeDeclaration::new("committee", "Committee")
        .property(PropertyDeclaration::new("title", PropertyType::Text))
        .property(
            PropertyDeclaration::new("members", PropertyType::EntityReference)
                .name("Members")
                .references("person")
                .multiple()
                .required(),
        );
    registry
        .register_module(Arc::new(DeclarativeModule::new(
            "samples",
            vec![everything(), company, person, committee],
        )))
        .unwrap();
    for key in ["sample", "company", "person", "committee"] {
        registry.schema().build_table(key, false).unwrap();
    }
    registry
}

fn setup() -> EntityRegistry {
    setup_with(
        StaticContext::new()
            .with_user("alice")
            .with_project(5)
            .in_project(3)
            .with_record(3, "101"),
    )
}

fn rejected(entity: &mut Entity<'_>, data: JsonValue) -> Vec<String> {
    match entity.set_data(data) {
        Err(EntityError::ValidationFailed(errors)) => errors.keys().map(str::to_owned).collect(),
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[test]
fn each_type_rejects_values_of_the_wrong_shape() {
    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    let keys = rejected(
        &mut sample,
        json!({
            "text": 5,
            "long_text": ["a"],
            "email": "not-an-email",
            "integer": 12.5,
            "date": "yesterday",
            "boolean": "yes",
            "price": -1,
            "user": "mallory",
            "project": 99,
            "record": "999",
            "color": "green",
            "level": 3,
            "unknown": 1,
        }),
    );
    assert_eq!(
        keys,
        vec![
            "boolean", "color", "date", "email", "integer", "level", "long_text", "price", "project",
            "record", "text", "unknown", "user"
        ]
    );
    assert_eq!(sample.errors().unwrap().len(), 13);
    assert_eq!(sample.errors().unwrap().get("unknown"), Some("Unknown property"));
}

#[test]
fn each_type_accepts_and_coerces_valid_values() {
    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample
        .set_data(json!({
            "text": "hello",
            "long_text": "a longer text",
            "email": "alice@example.org",
            "integer": "12",
            "date": 1087603200,
            "boolean": "0",
            "price": 1250,
            "user": "alice",
            "project": 5,
            "record": "101",
            "json": [1, {"a": true}],
            "color": "red",
            "level": 2,
            "name": "ok",
        }))
        .unwrap();
    assert!(sample.errors().unwrap().is_empty());
    assert_eq!(sample.value("integer"), Some(&Value::Integer(12)));
    assert_eq!(sample.value("boolean"), Some(&Value::Boolean(false)));
    assert_eq!(sample.value("project"), Some(&Value::Integer(5)));
    assert_eq!(sample.value("json"), Some(&Value::Json("[1,{\"a\":true}]".into())));
    assert_eq!(sample.value("level"), Some(&Value::Integer(2)));

    let id = sample.save().unwrap();
    let loaded = registry.get_instance("sample", Some(id)).unwrap().unwrap();
    assert_eq!(loaded.get_data()["json"], json!([1, {"a": true}]));
    assert_eq!(loaded.get_data()["email"], json!("alice@example.org"));
}

#[test]
fn failed_validation_leaves_data_untouched() {
    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"text": "before", "integer": 1})).unwrap();

    let keys = rejected(&mut sample, json!({"text": "after", "integer": "one"}));
    assert_eq!(keys, vec!["integer"]);
    assert_eq!(sample.value("text"), Some(&Value::Text("before".into())));
    assert_eq!(sample.value("integer"), Some(&Value::Integer(1)));
}

#[test]
fn empty_strings_become_null_unless_required() {
    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"text": "x", "email": "a@b.co"})).unwrap();
    sample.set_data(json!({"text": "", "email": null})).unwrap();
    assert_eq!(sample.value("text"), Some(&Value::Null));
    assert_eq!(sample.value("email"), Some(&Value::Null));

    assert_eq!(rejected(&mut sample, json!({"name": ""})), vec!["name"]);
    assert_eq!(sample.errors().unwrap().get("name"), Some("name is required"));
}

#[test]
fn json_strings_are_kept_when_already_serialized() {
    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"json": "{\"a\": 1}"})).unwrap();
    assert_eq!(sample.value("json"), Some(&Value::Json("{\"a\": 1}".into())));
    assert_eq!(sample.get_data()["json"], json!({"a": 1}));

    sample.set_data(json!({"json": "plain words"})).unwrap();
    assert_eq!(sample.value("json"), Some(&Value::Json("\"plain words\"".into())));
    assert_eq!(sample.get_data()["json"], json!("plain words"));
}

#[test]
fn required_name_scenario() {
    let registry = setup();
    match registry.create("company", json!({"name": ""})) {
        Err(EntityError::ValidationFailed(errors)) => assert!(errors.contains("name")),
        other => panic!("unexpected {other:?}"),
    }
    let acme = registry.create("company", json!({"name": "Acme"})).unwrap().unwrap();
    assert_eq!(acme.id(), Some(1));
    let loaded = registry.get_instance("company", Some(1)).unwrap().unwrap();
    assert_eq!(loaded.get_label().as_deref(), Some("Acme"));
}

#[test]
fn references_must_point_at_existing_entities() {
    let registry = setup();
    assert_eq!(
        registry
            .create("person", json!({"name": "Ann", "employer": 1}))
            .unwrap_err()
            .to_string(),
        "Validation failed: employer: The referenced company #1 does not exist"
    );

    let acme = registry.create("company", json!({"name": "Acme"})).unwrap().unwrap();
    let ann = registry
        .create("person", json!({"name": "Ann", "employer": acme.id()}))
        .unwrap()
        .unwrap();

    let mut acme = registry.get_instance("company", acme.id()).unwrap().unwrap();
    let mut person = registry.get_instance("person", None).unwrap().unwrap();
    assert_eq!(rejected(&mut acme, json!({"ceo": 42})), vec!["ceo"]);
    acme.set_data(json!({"ceo": ann.id()})).unwrap();
    acme.save().unwrap();

    // several references are checked one by one
    assert_eq!(rejected(&mut person, json!({"name": "Bo", "boards": [1, 7]})), vec!["boards"]);
    person.set_data(json!({"name": "Bo", "boards": [1]})).unwrap();
    assert_eq!(person.value("boards"), Some(&Value::Json("[1]".into())));
    let id = person.save().unwrap();
    let bo = registry.get_instance("person", Some(id)).unwrap().unwrap();
    assert_eq!(bo.get_data()["boards"], json!([1]));
    // a single reference takes one id, not a list
    assert_eq!(rejected(&mut person, json!({"employer": [1]})), vec!["employer"]);
}

#[test]
fn project_access_depends_on_the_acting_user() {
    // nobody signed in: existence is enough
    let registry = setup_with(StaticContext::new().with_project(5));
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"project": 5})).unwrap();

    let registry = setup_with(StaticContext::new().acting_as("alice").with_project(5));
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    assert_eq!(rejected(&mut sample, json!({"project": 5})), vec!["project"]);

    let registry = setup_with(StaticContext::new().acting_as("alice").with_project(5).with_privilege(5, "alice"));
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"project": 5})).unwrap();

    let registry = setup_with(StaticContext::new().acting_as("root").with_project(5).super_user());
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"project": 5})).unwrap();
}

#[test]
fn records_need_a_project_context() {
    let registry = setup_with(StaticContext::new().with_record(3, "101"));
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    assert_eq!(rejected(&mut sample, json!({"record": "101"})), vec!["record"]);
    assert_eq!(
        sample.errors().unwrap().get("record"),
        Some("Records can only be referenced within a project")
    );

    let registry = setup();
    let mut sample = registry.get_instance("sample", None).unwrap().unwrap();
    sample.set_data(json!({"record": 101})).unwrap();
    assert_eq!(sample.value("record"), Some(&Value::Text("101".into())));
}

#[test]
fn new_entities_need_every_required_property() {
    let registry = setup();
    match registry.create("company", json!({"ceo": null})) {
        Err(EntityError::ValidationFailed(errors)) => {
            assert_eq!(errors.get("name"), Some("name is required"));
            assert_eq!(errors.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(registry.schema().row_count("company").unwrap(), 0);

    // the failures stay on the entity like those of set_data
    let mut company = registry.get_instance("company", None).unwrap().unwrap();
    company.set_data(json!({})).unwrap();
    assert!(company.save().is_err());
    assert!(company.errors().unwrap().contains("name"));

    // an update only checks what it is given
    let mut acme = registry.create("company", json!({"name": "Acme"})).unwrap().unwrap();
    acme.set_data(json!({"ceo": null})).unwrap();
    acme.save().unwrap();
}

#[test]
fn an_empty_list_does_not_satisfy_a_required_reference() {
    let registry = setup();
    let ann = registry.create("person", json!({"name": "Ann"})).unwrap().unwrap();
    let mut committee = registry.get_instance("committee", None).unwrap().unwrap();

    assert_eq!(rejected(&mut committee, json!({"members": []})), vec!["members"]);
    assert_eq!(committee.errors().unwrap().get("members"), Some("Members is required"));
    assert_eq!(rejected(&mut committee, json!({"members": "[]"})), vec!["members"]);

    committee.set_data(json!({"members": [ann.id()]})).unwrap();
    let id = committee.save().unwrap();
    let loaded = registry.get_instance("committee", Some(id)).unwrap().unwrap();
    assert_eq!(loaded.get_data()["members"], json!([1]));

    // optional lists store nothing when empty
    let mut bo = registry.get_instance("person", None).unwrap().unwrap();
    bo.set_data(json!({"name": "Bo", "boards": []})).unwrap();
    assert_eq!(bo.value("boards"), Some(&Value::Null));
}
