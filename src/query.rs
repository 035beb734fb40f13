//! Parameterized SELECT/COUNT over one entity type's table.
//!
//! The base table is aliased `e`. Every identifier that reaches statement
//! text passes the sanitizer; every value is bound as a parameter.
//! Expressions given to [`EntityQuery::add_field`] are SQL written by the
//! calling code (computed columns such as a property's `sql_field`) and
//! must never carry request input.

use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use seahash::SeaHasher;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::declaration::BASE_COLUMNS;
use crate::entity::Entity;
use crate::error::{EntityError, Result};
use crate::registry::{EntityRegistry, EntityTypeInfo};
use crate::sanitize::{is_identifier, quote_column_ref, quote_identifier, quoted_table_name, to_sql_value};

pub type IdHasher = BuildHasherDefault<SeaHasher>;
pub type RawResults = HashMap<i64, JsonMap<String, JsonValue>, IdHasher>;

const BASE_ALIAS: &str = "e";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Le,
    Ge,
    /// `<>`
    Ne,
    /// `!=`
    NotEq,
    Like,
}

impl Operator {
    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Ne => "<>",
            Operator::NotEq => "!=",
            Operator::Like => "LIKE",
        }
    }
}

impl FromStr for Operator {
    type Err = EntityError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "=" => Ok(Operator::Eq),
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            "<>" => Ok(Operator::Ne),
            "!=" => Ok(Operator::NotEq),
            "LIKE" => Ok(Operator::Like),
            _ => Err(EntityError::InvalidOperator(s.to_owned())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    FullOuter,
}

impl JoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::FullOuter => "FULL OUTER JOIN",
        }
    }
}

impl FromStr for JoinType {
    type Err = EntityError;
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        match normalized.as_str() {
            "INNER" => Ok(JoinType::Inner),
            "LEFT" => Ok(JoinType::Left),
            "RIGHT" => Ok(JoinType::Right),
            "OUTER FULL" | "FULL OUTER" | "FULL" => Ok(JoinType::FullOuter),
            _ => Err(EntityError::InvalidArgument(format!("unknown join type '{s}'"))),
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    expression: String,
    alias: String,
}

#[derive(Debug, Clone)]
struct Join {
    kind: JoinType,
    table: String,
    alias: String,
    on: String,
}

#[derive(Debug, Clone)]
struct Condition {
    sql: String,
    params: Vec<SqlValue>,
}

/// What [`EntityQuery::execute`] produced.
#[derive(Debug)]
pub enum QueryOutput<'r> {
    Count(i64),
    Ids(Vec<i64>),
    Entities(Vec<Entity<'r>>),
}

impl<'r> QueryOutput<'r> {
    pub fn count(&self) -> i64 {
        match self {
            QueryOutput::Count(n) => *n,
            QueryOutput::Ids(ids) => ids.len() as i64,
            QueryOutput::Entities(entities) => entities.len() as i64,
        }
    }
    pub fn into_ids(self) -> Vec<i64> {
        match self {
            QueryOutput::Count(_) => Vec::new(),
            QueryOutput::Ids(ids) => ids,
            QueryOutput::Entities(entities) => entities.iter().filter_map(Entity::id).collect(),
        }
    }
    pub fn into_entities(self) -> Vec<Entity<'r>> {
        match self {
            QueryOutput::Entities(entities) => entities,
            _ => Vec::new(),
        }
    }
}

pub struct EntityQuery<'r> {
    registry: &'r EntityRegistry,
    info: Arc<EntityTypeInfo>,
    fields: Vec<Field>,
    joins: Vec<Join>,
    conditions: Vec<Condition>,
    order: Vec<(String, bool)>,
    limit: i64,
    offset: i64,
    count: bool,
    raw_results: RawResults,
}

impl<'r> EntityQuery<'r> {
    pub fn new(registry: &'r EntityRegistry, info: Arc<EntityTypeInfo>) -> Self {
        Self {
            registry,
            info,
            fields: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            limit: 0,
            offset: 0,
            count: false,
            raw_results: RawResults::default(),
        }
    }

    pub fn entity_type(&self) -> &str {
        self.info.key()
    }

    fn is_column(&self, name: &str) -> bool {
        BASE_COLUMNS.contains(&name) || self.info.declaration.property_decl(name).is_some()
    }

    fn field(&self, alias: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.alias == alias)
    }

    /// Resolves a column reference for use in a condition. A bare name must
    /// be a column of the base table or an added field; columns of joined
    /// tables are written `alias.column`.
    fn operand(&self, expr: &str) -> Result<String> {
        if expr.contains('.') {
            return quote_column_ref(expr);
        }
        if let Some(field) = self.field(expr) {
            return Ok(format!("({})", field.expression));
        }
        if self.is_column(expr) {
            return Ok(format!("{}.{}", quote_identifier(BASE_ALIAS)?, quote_identifier(expr)?));
        }
        Err(EntityError::InvalidIdentifier(expr.to_owned()))
    }

    /// Projects `expression AS alias` next to the entity columns.
    pub fn add_field(mut self, expression: &str, alias: &str) -> Result<Self> {
        quote_identifier(alias)?;
        if self.is_column(alias) || self.field(alias).is_some() {
            return Err(EntityError::InvalidArgument(format!("field alias '{alias}' is already in use")));
        }
        if expression.trim().is_empty() {
            return Err(EntityError::InvalidArgument(format!("field '{alias}' has no expression")));
        }
        self.fields.push(Field {
            expression: expression.to_owned(),
            alias: alias.to_owned(),
        });
        Ok(self)
    }

    /// Projects the declared `sql_field` of a property under the property key.
    pub fn add_property_field(self, key: &str, alias: &str) -> Result<Self> {
        let expression = self
            .info
            .declaration
            .property_decl(key)
            .and_then(|p| p.sql_field.clone())
            .ok_or_else(|| EntityError::InvalidArgument(format!("property '{key}' has no sql_field")))?;
        self.add_field(&expression, alias)
    }

    /// `expr = value`; see [`EntityQuery::condition_op`].
    pub fn condition(self, expr: &str, value: impl Into<JsonValue>) -> Result<Self> {
        self.condition_op(expr, value, "=")
    }

    /// Adds a condition. Arrays become `IN (...)` (an empty array matches
    /// nothing) and null becomes `IS NULL`, whatever the operator.
    pub fn condition_op(mut self, expr: &str, value: impl Into<JsonValue>, op: &str) -> Result<Self> {
        let operator: Operator = op.parse()?;
        let operand = self.operand(expr)?;
        let condition = match value.into() {
            JsonValue::Null => Condition {
                sql: format!("{operand} IS NULL"),
                params: Vec::new(),
            },
            JsonValue::Array(items) if items.is_empty() => Condition {
                sql: "0 = 1".to_owned(),
                params: Vec::new(),
            },
            JsonValue::Array(items) => Condition {
                sql: format!("{operand} IN ({})", vec!["?"; items.len()].join(", ")),
                params: items.iter().map(to_sql_value).collect(),
            },
            other => Condition {
                sql: format!("{operand} {} ?", operator.sql()),
                params: vec![to_sql_value(&other)],
            },
        };
        self.conditions.push(condition);
        Ok(self)
    }

    /// Joins a table. `on` is one or more `<column> <operator> <column>`
    /// comparisons separated by `AND`, with spaces around each operator,
    /// e.g. `s.id = e.site`.
    pub fn join(mut self, table: &str, alias: &str, on: &str, kind: JoinType) -> Result<Self> {
        let table = quote_identifier(table)?;
        if alias == BASE_ALIAS || self.joins.iter().any(|j| j.alias == alias) {
            return Err(EntityError::InvalidArgument(format!("join alias '{alias}' is already in use")));
        }
        quote_identifier(alias)?;
        let on = compile_join_condition(on)?;
        self.joins.push(Join {
            kind,
            table,
            alias: alias.to_owned(),
            on,
        });
        Ok(self)
    }

    /// Joins the table of another enabled entity type.
    pub fn join_entity(self, entity_type: &str, alias: &str, on: &str, kind: JoinType) -> Result<Self> {
        let info = self
            .registry
            .entity_type(entity_type)?
            .ok_or_else(|| EntityError::UnknownEntityType(entity_type.to_owned()))?;
        let table = info.table_name()?;
        self.join(&table, alias, on, kind)
    }

    /// Appends a sort key; earlier keys take precedence.
    pub fn order_by(mut self, expr: &str, desc: bool) -> Result<Self> {
        let target = if expr.contains('.') {
            quote_column_ref(expr)?
        } else if self.field(expr).is_some() {
            quote_identifier(expr)?
        } else {
            self.operand(expr)?
        };
        self.order.push((target, desc));
        Ok(self)
    }

    /// `limit` 0 means no limit.
    pub fn limit(mut self, limit: i64, offset: i64) -> Result<Self> {
        if limit < 0 || offset < 0 {
            return Err(EntityError::InvalidArgument(format!(
                "limit and offset must not be negative (limit {limit}, offset {offset})"
            )));
        }
        self.limit = limit;
        self.offset = offset;
        Ok(self)
    }

    pub fn count_query(mut self) -> Self {
        self.count = true;
        self
    }

    /// The statement and its parameters.
    pub fn to_sql(&self, require_all_conditions: bool) -> Result<(String, Vec<SqlValue>)> {
        let base = quote_identifier(BASE_ALIAS)?;
        let mut sql = if self.count {
            format!("SELECT COUNT(DISTINCT {base}.\"id\")")
        } else {
            let mut projection = vec![format!("{base}.*")];
            for field in &self.fields {
                projection.push(format!("({}) AS {}", field.expression, quote_identifier(&field.alias)?));
            }
            format!("SELECT {}", projection.join(", "))
        };
        sql.push_str(&format!(" FROM {} AS {base}", quoted_table_name(self.info.key())?));
        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} AS {} ON {}",
                join.kind.sql(),
                join.table,
                quote_identifier(&join.alias)?,
                join.on
            ));
        }
        let mut params = Vec::new();
        if !self.conditions.is_empty() {
            let glue = if require_all_conditions { " AND " } else { " OR " };
            let clauses: Vec<String> = self.conditions.iter().map(|c| format!("({})", c.sql)).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(glue));
            for condition in &self.conditions {
                params.extend(condition.params.iter().cloned());
            }
        }
        if self.count {
            return Ok((sql, params));
        }
        sql.push_str(" ORDER BY ");
        if self.order.is_empty() {
            sql.push_str(&format!("{base}.\"id\" DESC"));
        } else {
            let keys: Vec<String> = self
                .order
                .iter()
                .map(|(target, desc)| if *desc { format!("{target} DESC") } else { format!("{target} ASC") })
                .collect();
            sql.push_str(&keys.join(", "));
        }
        if self.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", self.limit));
            if self.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", self.offset));
            }
        } else if self.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", self.offset));
        }
        Ok((sql, params))
    }

    /// Runs the query. Conditions are combined with AND, or with OR when
    /// `require_all_conditions` is false. Ids keep the result order.
    pub fn execute(&mut self, load_objects: bool, require_all_conditions: bool) -> Result<QueryOutput<'r>> {
        let (sql, params) = self.to_sql(require_all_conditions)?;
        if self.count {
            let count = self.registry.persistor()?.select_scalar(&sql, &params)?;
            return Ok(QueryOutput::Count(count));
        }
        let rows = self.registry.persistor()?.select(&sql, &params)?;
        self.raw_results.clear();
        let mut ids = Vec::with_capacity(rows.len());
        let mut entities = Vec::new();
        for row in &rows {
            let id = match row.get_i64("id") {
                Some(id) => id,
                None => continue,
            };
            if self.raw_results.contains_key(&id) {
                continue;
            }
            self.raw_results.insert(id, row.to_json());
            ids.push(id);
            if load_objects {
                entities.push(Entity::from_row(self.registry, Arc::clone(&self.info), row)?);
            }
        }
        Ok(if load_objects {
            QueryOutput::Entities(entities)
        } else {
            QueryOutput::Ids(ids)
        })
    }

    /// Rows of the last execution keyed by id, including added fields.
    pub fn raw_results(&self) -> &RawResults {
        &self.raw_results
    }
}

/// Compiles `a.x = b.y AND ...` into quoted SQL, rejecting anything else.
fn compile_join_condition(on: &str) -> Result<String> {
    let tokens: Vec<&str> = on.split_whitespace().collect();
    let invalid = || EntityError::InvalidArgument(format!("unsupported join condition '{on}'"));
    if tokens.is_empty() {
        return Err(invalid());
    }
    let mut clauses = Vec::new();
    for clause in tokens.split(|t| t.eq_ignore_ascii_case("AND")) {
        match clause {
            [left, op, right] if is_reference(left) && is_reference(right) => {
                let operator: Operator = op.parse()?;
                clauses.push(format!(
                    "{} {} {}",
                    quote_column_ref(left)?,
                    operator.sql(),
                    quote_column_ref(right)?
                ));
            }
            _ => return Err(invalid()),
        }
    }
    Ok(clauses.join(" AND "))
}

fn is_reference(token: &str) -> bool {
    match token.split_once('.') {
        Some((qualifier, column)) => is_identifier(qualifier) && is_identifier(column),
        None => is_identifier(token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_come_from_the_allow_list() {
        assert_eq!("like".parse::<Operator>().unwrap(), Operator::Like);
        assert_eq!(" <> ".parse::<Operator>().unwrap().sql(), "<>");
        assert!(matches!("; DROP".parse::<Operator>(), Err(EntityError::InvalidOperator(_))));
        assert!("==".parse::<Operator>().is_err());
    }

    #[test]
    fn join_types_accept_both_full_spellings() {
        assert_eq!("outer full".parse::<JoinType>().unwrap(), JoinType::FullOuter);
        assert_eq!("FULL  OUTER".parse::<JoinType>().unwrap(), JoinType::FullOuter);
        assert!("CROSS".parse::<JoinType>().is_err());
    }

    #[test]
    fn join_conditions_are_quoted() {
        assert_eq!(
            compile_join_condition("s.id = e.site and s.active >= e.flag").unwrap(),
            "\"s\".\"id\" = \"e\".\"site\" AND \"s\".\"active\" >= \"e\".\"flag\""
        );
        assert!(compile_join_condition("s.id = 1 OR 1=1").is_err());
        assert!(compile_join_condition("s.id=e.site").is_err());
    }
}
