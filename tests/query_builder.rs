use std::sync::Arc;

use entity_store::context::StaticContext;
use entity_store::datatype::PropertyType;
use entity_store::declaration::{EntityTypeDeclaration, PropertyDeclaration};
use entity_store::module::DeclarativeModule;
use entity_store::persist::PersistenceMode;
use entity_store::registry::EntityRegistry;
use entity_store::{EntityError, EntityQuery, JoinType, QueryOutput};
use serde_json::{json, Value as JsonValue};

fn setup() -> EntityRegistry {
    let context = StaticContext::new().with_ticking_clock(1_000);
    let registry = EntityRegistry::new(PersistenceMode::InMemory, Arc::new(context)).expect("registry");
    let category = EntityTypeDeclaration::new("category", "Category")
        .property(PropertyDeclaration::new("name", PropertyType::Text).required());
    let item = EntityTypeDeclaration::new("item", "Item")
        .property(PropertyDeclaration::new("name", PropertyType::Text).required())
        .property(PropertyDeclaration::new("status", PropertyType::Text))
        .property(PropertyDeclaration::new("rank", PropertyType::Integer))
        .property(PropertyDeclaration::new("featured", PropertyType::Boolean))
        .property(PropertyDeclaration::new("category", PropertyType::EntityReference).references("category"))
        .property(
            PropertyDeclaration::new("name_length", PropertyType::Integer).sql_field("LENGTH(\"e\".\"name\")"),
        );
    registry
        .register_module(Arc::new(DeclarativeModule::new("catalog", vec![category, item])))
        .unwrap();
    registry.schema().build_table("category", false).unwrap();
    registry.schema().build_table("item", false).unwrap();
    registry
}

/// 15 items; odd ranks and item 2 are active (8 in total), the rest retired.
/// Each item is one clock tick newer than the previous one.
fn seed(registry: &EntityRegistry) -> Vec<i64> {
    let tools = registry.create("category", json!({"name": "tools"})).unwrap().unwrap();
    let toys = registry.create("category", json!({"name": "toys"})).unwrap().unwrap();
    let mut ids = Vec::new();
    for rank in 1..=15 {
        let active = (rank % 2 == 1 && rank != 15) || rank == 2;
        let status = if active { "active" } else { "retired" };
        let category = if rank <= 5 { tools.id() } else { toys.id() };
        let item = registry
            .create(
                "item",
                json!({
                    "name": format!("item {rank:02}"),
                    "status": status,
                    "rank": rank,
                    "featured": rank % 5 == 0,
                    "category": category,
                }),
            )
            .unwrap()
            .unwrap();
        ids.push(item.id().unwrap());
    }
    ids
}

fn ids(output: QueryOutput<'_>) -> Vec<i64> {
    output.into_ids()
}

fn by_rank(query: EntityQuery<'_>) -> Vec<i64> {
    let mut query = query.order_by("rank", false).unwrap();
    ids(query.execute(false, true).unwrap())
}

#[test]
fn newest_active_items_first() {
    let registry = setup();
    let seeded = seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .condition("status", "active")
        .unwrap()
        .order_by("updated", true)
        .unwrap()
        .limit(10, 0)
        .unwrap();
    let found = ids(query.execute(false, true).unwrap());

    // ranks 1, 2, 3, 5, 7, 9, 11, 13 in reverse
    let expected: Vec<i64> = [13, 11, 9, 7, 5, 3, 2, 1].iter().map(|rank| seeded[rank - 1]).collect();
    assert_eq!(found, expected);
}

#[test]
fn default_order_is_newest_id_first() {
    let registry = setup();
    seed(&registry);
    let query = registry.query("item").unwrap();
    let (sql, params) = query.to_sql(true).unwrap();
    assert_eq!(sql, "SELECT \"e\".* FROM \"entity_store_item\" AS \"e\" ORDER BY \"e\".\"id\" DESC");
    assert!(params.is_empty());

    let mut query = registry.query("item").unwrap().limit(3, 0).unwrap();
    assert_eq!(ids(query.execute(false, true).unwrap()), vec![15, 14, 13]);
}

#[test]
fn conditions_bind_values_as_parameters() {
    let registry = setup();
    seed(&registry);
    let query = registry
        .query("item")
        .unwrap()
        .condition("name", "x' OR '1'='1")
        .unwrap()
        .condition_op("rank", 3, ">=")
        .unwrap()
        .condition("status", vec!["active", "retired"])
        .unwrap()
        .condition("featured", JsonValue::Null)
        .unwrap();
    let (sql, params) = query.to_sql(true).unwrap();
    assert_eq!(
        sql,
        "SELECT \"e\".* FROM \"entity_store_item\" AS \"e\" \
         WHERE (\"e\".\"name\" = ?) AND (\"e\".\"rank\" >= ?) AND (\"e\".\"status\" IN (?, ?)) AND (\"e\".\"featured\" IS NULL) \
         ORDER BY \"e\".\"id\" DESC"
    );
    assert_eq!(params.len(), 4);
}

#[test]
fn operators_arrays_and_nulls() {
    let registry = setup();
    seed(&registry);
    assert_eq!(by_rank(registry.query("item").unwrap().condition_op("rank", 13, ">").unwrap()), vec![14, 15]);
    assert_eq!(by_rank(registry.query("item").unwrap().condition_op("rank", 2, "<=").unwrap()), vec![1, 2]);
    assert_eq!(
        by_rank(registry.query("item").unwrap().condition_op("name", "item 1%", "like").unwrap()),
        vec![10, 11, 12, 13, 14, 15]
    );
    assert_eq!(by_rank(registry.query("item").unwrap().condition("rank", vec![4, 8, 99]).unwrap()), vec![4, 8]);
    assert!(by_rank(registry.query("item").unwrap().condition("rank", Vec::<i64>::new()).unwrap()).is_empty());
    assert_eq!(
        by_rank(registry.query("item").unwrap().condition("featured", true).unwrap()),
        vec![5, 10, 15]
    );
    assert_eq!(
        by_rank(registry.query("item").unwrap().condition_op("status", "retired", "!=").unwrap()).len(),
        8
    );
    // null ignores the operator
    assert!(by_rank(registry.query("item").unwrap().condition_op("rank", JsonValue::Null, ">").unwrap()).is_empty());
}

#[test]
fn any_condition_may_match_when_requested() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .condition("rank", 1)
        .unwrap()
        .condition("rank", 2)
        .unwrap();
    assert!(ids(query.execute(false, true).unwrap()).is_empty());
    assert_eq!(ids(query.execute(false, false).unwrap()), vec![2, 1]);
}

#[test]
fn order_keys_compose() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .condition_op("rank", 10, "<=")
        .unwrap()
        .order_by("status", false)
        .unwrap()
        .order_by("rank", true)
        .unwrap();
    assert_eq!(ids(query.execute(false, true).unwrap()), vec![9, 7, 5, 3, 2, 1, 10, 8, 6, 4]);
}

#[test]
fn limits_and_offsets() {
    let registry = setup();
    seed(&registry);
    let page = |limit, offset| {
        let mut query = registry
            .query("item")
            .unwrap()
            .order_by("rank", false)
            .unwrap()
            .limit(limit, offset)
            .unwrap();
        ids(query.execute(false, true).unwrap())
    };
    assert_eq!(page(3, 0), vec![1, 2, 3]);
    assert_eq!(page(3, 6), vec![7, 8, 9]);
    assert_eq!(page(0, 13), vec![14, 15]);
    assert_eq!(page(0, 0).len(), 15);

    assert!(matches!(registry.query("item").unwrap().limit(-1, 0), Err(EntityError::InvalidArgument(_))));
    assert!(matches!(registry.query("item").unwrap().limit(5, -2), Err(EntityError::InvalidArgument(_))));
}

#[test]
fn count_queries_return_a_scalar() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .condition("status", "active")
        .unwrap()
        .order_by("rank", true)
        .unwrap()
        .limit(2, 0)
        .unwrap()
        .count_query();
    let (sql, _) = query.to_sql(true).unwrap();
    assert!(sql.starts_with("SELECT COUNT(DISTINCT \"e\".\"id\") FROM"));
    assert!(!sql.contains("ORDER BY"));
    match query.execute(true, true).unwrap() {
        QueryOutput::Count(n) => assert_eq!(n, 8),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn loaded_objects_are_hydrated_in_order() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .condition_op("rank", 3, "<=")
        .unwrap()
        .order_by("rank", false)
        .unwrap();
    let entities = query.execute(true, true).unwrap().into_entities();
    let labels: Vec<String> = entities.iter().filter_map(|e| e.get_label()).collect();
    assert_eq!(labels, vec!["#1", "#2", "#3"]);
    assert_eq!(entities[1].get_data()["name"], json!("item 02"));
    assert_eq!(entities[1].get_data()["featured"], json!(false));
}

#[test]
fn computed_fields_land_in_raw_results() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .add_field("\"e\".\"rank\" * 10", "score")
        .unwrap()
        .add_property_field("name_length", "chars")
        .unwrap()
        .condition_op("score", 30, "<=")
        .unwrap()
        .order_by("score", true)
        .unwrap();
    assert_eq!(ids(query.execute(true, true).unwrap()), vec![3, 2, 1]);
    let raw = query.raw_results();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw[&2]["score"], json!(20));
    assert_eq!(raw[&2]["chars"], json!(7));
    assert_eq!(raw[&2]["name"], json!("item 02"));

    assert!(matches!(
        registry.query("item").unwrap().add_field("1", "rank"),
        Err(EntityError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.query("item").unwrap().add_property_field("rank", "r"),
        Err(EntityError::InvalidArgument(_))
    ));
}

#[test]
fn joins_filter_on_the_joined_table() {
    let registry = setup();
    seed(&registry);
    let mut query = registry
        .query("item")
        .unwrap()
        .join_entity("category", "c", "c.id = e.category", JoinType::Inner)
        .unwrap()
        .condition("c.name", "tools")
        .unwrap()
        .add_field("\"c\".\"name\"", "category_name")
        .unwrap();
    let (sql, _) = query.to_sql(true).unwrap();
    assert!(sql.contains(
        "INNER JOIN \"entity_store_category\" AS \"c\" ON \"c\".\"id\" = \"e\".\"category\""
    ));
    assert_eq!(ids(query.execute(false, true).unwrap()), vec![5, 4, 3, 2, 1]);
    assert_eq!(query.raw_results()[&4]["category_name"], json!("tools"));

    let mut left = registry
        .query("item")
        .unwrap()
        .join("entity_store_category", "c", "c.id = e.category AND c.name = c.name", "left".parse().unwrap())
        .unwrap();
    assert_eq!(left.execute(false, true).unwrap().count(), 15);
}

#[test]
fn unsafe_input_is_rejected() {
    let registry = setup();
    let query = || registry.query("item").unwrap();
    assert!(matches!(query().condition("name; DROP TABLE x", 1), Err(EntityError::InvalidIdentifier(_))));
    assert!(matches!(query().condition_op("name", 1, "= 1 OR"), Err(EntityError::InvalidOperator(_))));
    assert!(matches!(query().order_by("rank DESC, 1", true), Err(EntityError::InvalidIdentifier(_))));
    assert!(matches!(query().add_field("1", "a b"), Err(EntityError::InvalidIdentifier(_))));
    assert!(matches!(
        query().join("entity_store_category c", "c", "c.id = e.category", JoinType::Left),
        Err(EntityError::InvalidIdentifier(_))
    ));
    assert!(matches!(
        query().join("entity_store_category", "c", "c.id = e.category OR 1 = 1", JoinType::Left),
        Err(EntityError::InvalidArgument(_))
    ));
    assert!(matches!(
        query().join_entity("ghost", "g", "g.id = e.category", JoinType::Left),
        Err(EntityError::UnknownEntityType(_))
    ));
    assert!(matches!(registry.query("ghost"), Err(EntityError::UnknownEntityType(_))));
}

#[test]
fn unknown_columns_are_rejected() {
    let registry = setup();
    seed(&registry);
    let query = || registry.query("item").unwrap();
    assert!(matches!(query().condition("statuss", "statuss"), Err(EntityError::InvalidIdentifier(ref s)) if s == "statuss"));
    assert!(matches!(query().condition_op("ranks", 3, ">"), Err(EntityError::InvalidIdentifier(_))));
    assert!(matches!(query().order_by("updatd", true), Err(EntityError::InvalidIdentifier(_))));

    // a misspelt column of a joined table fails when the statement runs
    let mut joined = query()
        .join_entity("category", "c", "c.id = e.category", JoinType::Inner)
        .unwrap()
        .condition("c.nmae", "tools")
        .unwrap();
    assert!(matches!(joined.execute(false, true), Err(EntityError::Persistence(_))));

    // added fields resolve by alias
    let mut scored = query()
        .add_field("\"e\".\"rank\" * 2", "double_rank")
        .unwrap()
        .condition("double_rank", 4)
        .unwrap();
    assert_eq!(ids(scored.execute(false, true).unwrap()), vec![2]);
}
