//
// The declarative search engine shared by every administrative resource.
//
// A resource declares a field table (external name, column, value type); the
// engine validates an incoming `SearchParams` against it, composes a
// parameterized SQL query for the active backend, and projects the loaded
// rows. The caller's VO is injected as an `eq` filter ahead of composition
// for multi-tenant resources, so no query can ever cross tenants.
//
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    Text,
    Integer,
    DateTime,
}

/// One row of a resource's field table: external name, backing column and
/// value coercion.
pub struct SearchField {
    pub name: &'static str,
    pub column: &'static str,
    pub ftype: FieldType,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum ScalarOperator {
    #[serde(rename = "eq")]
    Equal,
    #[serde(rename = "neq")]
    NotEqual,
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "lt")]
    LessThan,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not like")]
    NotLike,
    #[serde(rename = "regex")]
    Regex,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum VectorOperator {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SearchSpec {
    Scalar {
        parameter: String,
        operator: ScalarOperator,
        value: Value,
    },
    Vector {
        parameter: String,
        operator: VectorOperator,
        values: Vec<Value>,
    },
}

impl SearchSpec {
    pub fn eq(parameter: &str, value: &str) -> Self {
        SearchSpec::Scalar {
            parameter: parameter.to_string(),
            operator: ScalarOperator::Equal,
            value: Value::String(value.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc")]
    Asc,
    #[serde(rename = "desc")]
    Desc,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SortSpec {
    pub parameter: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchParams {
    /// Projected fields; `None` means all.
    #[serde(default)]
    pub parameters: Option<Vec<String>>,
    #[serde(default)]
    pub search: Vec<SearchSpec>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub distinct: bool,
}

/// Values carried to the database separately from the SQL text.
pub enum BindValue {
    Text(String),
    Int(i64),
    Ts(NaiveDateTime),
}

#[derive(Clone, Copy)]
pub enum Placeholder {
    /// `?` (SQLite, MySQL)
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

impl Placeholder {
    fn next(&self, counter: &mut usize) -> String {
        *counter += 1;
        match self {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${counter}"),
        }
    }
}

/// A `regex` filter evaluated by the engine when the backend has no native
/// regular expression operator.
pub struct PostRegex {
    pub field: String,
    pub regex: Regex,
}

/// The composed query: SQL fragments plus the bind values they reference.
pub struct QueryPlan {
    pub where_sql: String,
    pub order_sql: String,
    pub binds: Vec<BindValue>,
    pub post_regex: Vec<PostRegex>,
    pub distinct: bool,
}

impl QueryPlan {
    /// Rows cannot be counted and paged inside the database when the result
    /// still has to be regex-filtered or deduplicated by the engine.
    pub fn materialize(&self) -> bool {
        self.distinct || !self.post_regex.is_empty()
    }
}

fn find_field<'f>(fields: &'f [SearchField], name: &str) -> Result<&'f SearchField, Error> {
    match fields.iter().find(|f| f.name == name) {
        Some(field) => Ok(field),
        None => err_silent!(format!("Unknown search parameter {name}")),
    }
}

fn coerce(field: &SearchField, value: &Value) -> Result<BindValue, Error> {
    match field.ftype {
        FieldType::Text => match value {
            Value::String(s) => Ok(BindValue::Text(s.clone())),
            Value::Number(n) => Ok(BindValue::Text(n.to_string())),
            _ => err_silent!(format!("Invalid value for parameter {}", field.name)),
        },
        FieldType::Integer => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(BindValue::Int(i)),
                None => err_silent!(format!("Invalid integer value for parameter {}", field.name)),
            },
            Value::String(s) => match s.parse::<i64>() {
                Ok(i) => Ok(BindValue::Int(i)),
                Err(_) => err_silent!(format!("Invalid integer value for parameter {}", field.name)),
            },
            _ => err_silent!(format!("Invalid value for parameter {}", field.name)),
        },
        FieldType::DateTime => match value {
            Value::String(s) => match parse_datetime(s) {
                Some(dt) => Ok(BindValue::Ts(dt)),
                None => err_silent!(format!("Invalid datetime value for parameter {}", field.name)),
            },
            _ => err_silent!(format!("Invalid datetime value for parameter {}", field.name)),
        },
    }
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d"] {
        if format == "%Y-%m-%d" {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(value, format) {
                return d.and_hms_opt(0, 0, 0);
            }
        } else if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    None
}

/// Validates the request against the field table and composes the WHERE and
/// ORDER BY fragments. `vo` is the caller's tenant; when the resource is
/// multi-tenant it is prepended as an `eq` filter on `vo_column`.
pub fn plan_query(
    fields: &[SearchField],
    params: &SearchParams,
    vo_filter: Option<(&str, &str)>,
    placeholder: Placeholder,
    regex_op: Option<&str>,
) -> Result<QueryPlan, Error> {
    // Reject unknown projection fields up front
    if let Some(ref parameters) = params.parameters {
        for name in parameters {
            find_field(fields, name)?;
        }
    }

    let mut conditions: Vec<String> = Vec::new();
    let mut binds: Vec<BindValue> = Vec::new();
    let mut post_regex: Vec<PostRegex> = Vec::new();
    let mut counter = 0usize;

    // The implicit tenant filter comes first so that it is part of the
    // emitted query whatever the caller asked for.
    if let Some((vo_name, vo)) = vo_filter {
        let spec = SearchSpec::eq(vo_name, vo);
        compose_condition(fields, &spec, placeholder, regex_op, &mut conditions, &mut binds, &mut post_regex, &mut counter)?;
    }

    for spec in &params.search {
        compose_condition(fields, spec, placeholder, regex_op, &mut conditions, &mut binds, &mut post_regex, &mut counter)?;
    }

    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let mut order_parts: Vec<String> = Vec::new();
    for sort in &params.sort {
        let field = find_field(fields, &sort.parameter)?;
        let direction = match sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        order_parts.push(format!("{} {direction}", field.column));
    }
    let order_sql = if order_parts.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", order_parts.join(", "))
    };

    Ok(QueryPlan {
        where_sql,
        order_sql,
        binds,
        post_regex,
        distinct: params.distinct,
    })
}

#[allow(clippy::too_many_arguments)]
fn compose_condition(
    fields: &[SearchField],
    spec: &SearchSpec,
    placeholder: Placeholder,
    regex_op: Option<&str>,
    conditions: &mut Vec<String>,
    binds: &mut Vec<BindValue>,
    post_regex: &mut Vec<PostRegex>,
    counter: &mut usize,
) -> Result<(), Error> {
    match spec {
        SearchSpec::Scalar {
            parameter,
            operator,
            value,
        } => {
            let field = find_field(fields, parameter)?;
            match operator {
                ScalarOperator::Equal | ScalarOperator::NotEqual | ScalarOperator::GreaterThan | ScalarOperator::LessThan => {
                    let op = match operator {
                        ScalarOperator::Equal => "=",
                        ScalarOperator::NotEqual => "<>",
                        ScalarOperator::GreaterThan => ">",
                        ScalarOperator::LessThan => "<",
                        _ => unreachable!(),
                    };
                    binds.push(coerce(field, value)?);
                    conditions.push(format!("{} {op} {}", field.column, placeholder.next(counter)));
                }
                ScalarOperator::Like | ScalarOperator::NotLike => {
                    if field.ftype != FieldType::Text {
                        err_silent!(format!("Operator like is not valid for parameter {parameter}"))
                    }
                    let op = if *operator == ScalarOperator::Like {
                        "LIKE"
                    } else {
                        "NOT LIKE"
                    };
                    binds.push(coerce(field, value)?);
                    conditions.push(format!("{} {op} {}", field.column, placeholder.next(counter)));
                }
                ScalarOperator::Regex => {
                    if field.ftype != FieldType::Text {
                        err_silent!(format!("Operator regex is not valid for parameter {parameter}"))
                    }
                    let Value::String(pattern) = value else {
                        err_silent!(format!("Invalid regex value for parameter {parameter}"))
                    };
                    match regex_op {
                        Some(op) => {
                            binds.push(BindValue::Text(pattern.clone()));
                            conditions.push(format!("{} {op} {}", field.column, placeholder.next(counter)));
                        }
                        // No native operator: the engine filters the
                        // materialized rows itself.
                        None => match Regex::new(pattern) {
                            Ok(regex) => post_regex.push(PostRegex {
                                field: field.name.to_string(),
                                regex,
                            }),
                            Err(e) => err_silent!(format!("Invalid regex for parameter {parameter}"), e.to_string()),
                        },
                    }
                }
            }
        }
        SearchSpec::Vector {
            parameter,
            operator,
            values,
        } => {
            let field = find_field(fields, parameter)?;
            if values.is_empty() {
                // Degenerate but well defined
                conditions.push(
                    match operator {
                        VectorOperator::In => "1 = 0",
                        VectorOperator::NotIn => "1 = 1",
                    }
                    .to_string(),
                );
                return Ok(());
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                binds.push(coerce(field, value)?);
                placeholders.push(placeholder.next(counter));
            }
            let op = match operator {
                VectorOperator::In => "IN",
                VectorOperator::NotIn => "NOT IN",
            };
            conditions.push(format!("{} {op} ({})", field.column, placeholders.join(", ")));
        }
    }
    Ok(())
}

/// Projects a full row onto the requested parameters. Unknown names have been
/// rejected during planning.
pub fn project(row: &Map<String, Value>, parameters: &Option<Vec<String>>) -> Map<String, Value> {
    match parameters {
        None => row.clone(),
        Some(names) => {
            let mut projected = Map::new();
            for name in names {
                if let Some(value) = row.get(name) {
                    projected.insert(name.clone(), value.clone());
                }
            }
            projected
        }
    }
}

/// Engine-side `regex` evaluation for backends without a native operator.
pub fn matches_post_regex(row: &Map<String, Value>, post_regex: &[PostRegex]) -> bool {
    post_regex.iter().all(|pr| {
        let text = match row.get(&pr.field) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return false,
        };
        pr.regex.is_match(&text)
    })
}

/// Full materialized pipeline: regex filter, project, optionally dedup, page.
/// Returns `(total_matching, page_rows)`.
pub fn finish_materialized(
    rows: Vec<Map<String, Value>>,
    plan: &QueryPlan,
    parameters: &Option<Vec<String>>,
    page: u64,
    per_page: u64,
) -> (u64, Vec<Map<String, Value>>) {
    let mut projected: Vec<Map<String, Value>> = Vec::with_capacity(rows.len());
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        if !matches_post_regex(&row, &plan.post_regex) {
            continue;
        }
        let row = project(&row, parameters);
        if plan.distinct {
            // serde_json maps are ordered, so the serialization is canonical
            let key = serde_json::to_string(&row).unwrap_or_default();
            if !seen.insert(key) {
                continue;
            }
        }
        projected.push(row);
    }

    let total = projected.len() as u64;
    let start = (page.saturating_sub(1) * per_page).min(total);
    let end = (start + per_page).min(total);
    (total, projected[start as usize..end as usize].to_vec())
}

/// Clamp the requested page size to the installation maximum.
pub fn clamp_per_page(per_page: u64) -> u64 {
    per_page.clamp(1, crate::CONFIG.max_page_size())
}

#[derive(diesel::QueryableByName)]
pub struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub count: i64,
}

/// Applies the planned bind values, in order, onto a boxed raw query.
pub fn apply_binds<'f, DB>(
    mut query: diesel::query_builder::BoxedSqlQuery<'f, DB, diesel::query_builder::SqlQuery>,
    binds: Vec<BindValue>,
) -> diesel::query_builder::BoxedSqlQuery<'f, DB, diesel::query_builder::SqlQuery>
where
    DB: diesel::backend::Backend
        + diesel::sql_types::HasSqlType<diesel::sql_types::Text>
        + diesel::sql_types::HasSqlType<diesel::sql_types::BigInt>
        + diesel::sql_types::HasSqlType<diesel::sql_types::Timestamp>,
    String: diesel::serialize::ToSql<diesel::sql_types::Text, DB>,
    i64: diesel::serialize::ToSql<diesel::sql_types::BigInt, DB>,
    NaiveDateTime: diesel::serialize::ToSql<diesel::sql_types::Timestamp, DB>,
{
    for bind in binds {
        query = match bind {
            BindValue::Text(v) => query.bind::<diesel::sql_types::Text, _>(v),
            BindValue::Int(v) => query.bind::<diesel::sql_types::BigInt, _>(v),
            BindValue::Ts(v) => query.bind::<diesel::sql_types::Timestamp, _>(v),
        };
    }
    query
}

/// Implements the search entry point of one resource against every enabled
/// backend. The model must derive `QueryableByName` and provide
/// `to_search_row()`; the surrounding module provides `SEARCH_FIELDS`.
#[macro_export]
macro_rules! impl_searchable {
    ($model:ty, $table:literal, $vo_column:expr) => {
        impl $model {
            /// Composed search: `(total_matching, rows)`. The caller's VO is
            /// appended as an implicit `eq` filter when one is given.
            pub async fn search(
                params: &$crate::search::SearchParams,
                vo: Option<&str>,
                page: u64,
                per_page: u64,
                conn: &$crate::db::DbConn,
            ) -> Result<(u64, Vec<serde_json::Map<String, serde_json::Value>>), $crate::error::Error> {
                let per_page = $crate::search::clamp_per_page(per_page);
                let page = page.max(1);
                let vo_filter = vo.map(|v| ($vo_column, v));

                $crate::db_run! { conn:
                    sqlite {
                        $crate::search_backend! {
                            $model, $table, SEARCH_FIELDS, params, vo_filter, page, per_page, conn,
                            diesel::sqlite::Sqlite, $crate::search::Placeholder::Question, None
                        }
                    }
                    mysql {
                        $crate::search_backend! {
                            $model, $table, SEARCH_FIELDS, params, vo_filter, page, per_page, conn,
                            diesel::mysql::Mysql, $crate::search::Placeholder::Question, Some("REGEXP")
                        }
                    }
                    postgresql {
                        $crate::search_backend! {
                            $model, $table, SEARCH_FIELDS, params, vo_filter, page, per_page, conn,
                            diesel::pg::Pg, $crate::search::Placeholder::Dollar, Some("~")
                        }
                    }
                }
            }

            /// Grouped counts over the same filter language.
            pub async fn summary(
                grouping: &[String],
                search: &[$crate::search::SearchSpec],
                vo: Option<&str>,
                conn: &$crate::db::DbConn,
            ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, $crate::error::Error> {
                let params = $crate::search::SearchParams {
                    parameters: Some(grouping.to_vec()),
                    search: search.to_vec(),
                    sort: Vec::new(),
                    distinct: false,
                };
                let per_page = $crate::CONFIG.max_page_size();
                let (_, rows) = Self::search(&params, vo, 1, per_page, conn).await?;

                let mut counts: std::collections::BTreeMap<String, (serde_json::Map<String, serde_json::Value>, u64)> =
                    std::collections::BTreeMap::new();
                for row in rows {
                    let key = serde_json::to_string(&row).unwrap_or_default();
                    counts.entry(key).or_insert_with(|| (row, 0)).1 += 1;
                }

                Ok(counts
                    .into_values()
                    .map(|(mut row, count)| {
                        row.insert("count".to_string(), serde_json::Value::from(count));
                        row
                    })
                    .collect())
            }
        }
    };
}

/// One backend arm of the search implementation: plan, then either page in
/// SQL or materialize for engine-side regex / dedup.
#[macro_export]
macro_rules! search_backend {
    ($model:ty, $table:literal, $fields:expr, $params:expr, $vo_filter:expr, $page:expr, $per_page:expr,
     $conn:ident, $backend:ty, $placeholder:expr, $regex_op:expr) => {{
        use diesel::RunQueryDsl;

        let mut plan = $crate::search::plan_query($fields, $params, $vo_filter, $placeholder, $regex_op)?;

        if plan.materialize() {
            let sql = format!("SELECT * FROM {} {} {}", $table, plan.where_sql, plan.order_sql);
            let boxed = $crate::search::apply_binds::<$backend>(
                diesel::sql_query(sql).into_boxed::<$backend>(),
                std::mem::take(&mut plan.binds),
            );
            let rows: Vec<$model> = boxed.load($conn).map_err($crate::error::Error::from)?;
            let rows: Vec<serde_json::Map<String, serde_json::Value>> =
                rows.iter().map(|r| r.to_search_row()).collect();
            Ok($crate::search::finish_materialized(rows, &plan, &$params.parameters, $page, $per_page))
        } else {
            let count_sql = format!("SELECT COUNT(*) AS count FROM {} {}", $table, plan.where_sql);
            let row_sql = format!(
                "SELECT * FROM {} {} {} LIMIT {} OFFSET {}",
                $table,
                plan.where_sql,
                plan.order_sql,
                $per_page,
                ($page - 1) * $per_page,
            );

            // The same binds back both statements, in the same order.
            let count_binds = plan
                .binds
                .iter()
                .map(|b| match b {
                    $crate::search::BindValue::Text(v) => $crate::search::BindValue::Text(v.clone()),
                    $crate::search::BindValue::Int(v) => $crate::search::BindValue::Int(*v),
                    $crate::search::BindValue::Ts(v) => $crate::search::BindValue::Ts(*v),
                })
                .collect::<Vec<_>>();

            let total: i64 = $crate::search::apply_binds::<$backend>(
                diesel::sql_query(count_sql).into_boxed::<$backend>(),
                count_binds,
            )
            .get_result::<$crate::search::CountRow>($conn)
            .map_err($crate::error::Error::from)?
            .count;

            let rows: Vec<$model> = $crate::search::apply_binds::<$backend>(
                diesel::sql_query(row_sql).into_boxed::<$backend>(),
                plan.binds,
            )
            .load($conn)
            .map_err($crate::error::Error::from)?;

            let rows = rows.iter().map(|r| $crate::search::project(&r.to_search_row(), &$params.parameters)).collect();
            Ok((total as u64, rows))
        }
    }};
}
