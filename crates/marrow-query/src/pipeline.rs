//! Aggregation pipeline (component C8): a sequence of stages applied in
//! order to a row set, each stage's failure reported against its index
//! (spec §4.7/§7's `AggregationStageException`).

use std::collections::BTreeMap;

use marrow_model::{Error, ID_FIELD, Value, get_path};
use serde_json::Value as Json;

use crate::filter::Filter;
use crate::parse::{parse_filter, parse_sort};
use crate::sort::{SortKey, apply_sort};

pub enum Stage {
    Match(Filter),
    Project(Projection),
    Sort(Vec<SortKey>),
    Skip(usize),
    Limit(usize),
    Group(GroupSpec),
}

/// A pure inclusion or pure exclusion list of non-`_id` fields (spec
/// §4.7). `_id` is tracked separately since it's included by default
/// regardless of which mode the rest of the fields are in.
pub struct Projection {
    pub include: bool,
    pub include_id: bool,
    pub fields: Vec<String>,
}

pub struct GroupSpec {
    pub id_field: Option<String>,
    pub aggregations: Vec<(String, AggSpec)>,
}

pub enum AggSpec {
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Count,
    First(String),
    Last(String),
    Push(String),
    AddToSet(String),
}

/// The suspension-point-checked, caller-facing report of a pipeline run
/// (spec §5's "cancellation is observed between stages" / §6's wire
/// response shape). Used by the server layer; `Pipeline::execute` below is
/// the plain `Result`-returning form for composing inside this crate and
/// its tests.
pub struct PipelineResult {
    pub success: bool,
    pub documents: Vec<BTreeMap<String, Value>>,
    pub count: usize,
    pub stages_executed: usize,
    pub error_message: Option<String>,
}

pub fn execute(
    rows: Vec<BTreeMap<String, Value>>,
    stages: &[Stage],
) -> Result<Vec<BTreeMap<String, Value>>, Error> {
    Ok(run_stages(rows, stages, &|| false)?.0)
}

pub fn execute_cancellable(
    rows: Vec<BTreeMap<String, Value>>,
    stages: &[Stage],
    is_cancelled: &dyn Fn() -> bool,
) -> Result<Vec<BTreeMap<String, Value>>, Error> {
    Ok(run_stages(rows, stages, is_cancelled)?.0)
}

pub fn run_pipeline(rows: Vec<BTreeMap<String, Value>>, stages: &[Stage]) -> PipelineResult {
    run_pipeline_cancellable(rows, stages, &|| false)
}

pub fn run_pipeline_cancellable(
    rows: Vec<BTreeMap<String, Value>>,
    stages: &[Stage],
    is_cancelled: &dyn Fn() -> bool,
) -> PipelineResult {
    match run_stages(rows, stages, is_cancelled) {
        Ok((documents, stages_executed)) => {
            let count = documents.len();
            PipelineResult { success: true, documents, count, stages_executed, error_message: None }
        }
        Err(e) => {
            let stages_executed = match &e {
                Error::AggregationStageException { stage, .. } => *stage,
                _ => 0,
            };
            PipelineResult {
                success: false,
                documents: Vec::new(),
                count: 0,
                stages_executed,
                error_message: Some(e.to_string()),
            }
        }
    }
}

fn run_stages(
    mut rows: Vec<BTreeMap<String, Value>>,
    stages: &[Stage],
    is_cancelled: &dyn Fn() -> bool,
) -> Result<(Vec<BTreeMap<String, Value>>, usize), Error> {
    let mut executed = 0;
    for (index, stage) in stages.iter().enumerate() {
        if is_cancelled() {
            return Err(Error::Cancelled);
        }
        rows = apply_stage(rows, stage)
            .map_err(|message| Error::AggregationStageException { stage: index, message })?;
        executed += 1;
    }
    Ok((rows, executed))
}

fn apply_stage(
    rows: Vec<BTreeMap<String, Value>>,
    stage: &Stage,
) -> Result<Vec<BTreeMap<String, Value>>, String> {
    match stage {
        Stage::Match(filter) => Ok(rows.into_iter().filter(|r| filter.evaluate(r)).collect()),
        Stage::Project(projection) => Ok(rows.into_iter().map(|r| apply_projection(r, projection)).collect()),
        Stage::Sort(keys) => {
            let mut rows = rows;
            apply_sort(&mut rows, keys);
            Ok(rows)
        }
        Stage::Skip(n) => Ok(rows.into_iter().skip(*n).collect()),
        Stage::Limit(n) => Ok(rows.into_iter().take(*n).collect()),
        Stage::Group(spec) => execute_group(rows, spec),
    }
}

fn apply_projection(row: BTreeMap<String, Value>, projection: &Projection) -> BTreeMap<String, Value> {
    if projection.include {
        let mut out: BTreeMap<String, Value> = projection
            .fields
            .iter()
            .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
            .collect();
        if projection.include_id {
            if let Some(id) = row.get(ID_FIELD) {
                out.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        out
    } else {
        let mut out = row;
        for f in &projection.fields {
            out.remove(f);
        }
        if !projection.include_id {
            out.remove(ID_FIELD);
        }
        out
    }
}

fn execute_group(
    rows: Vec<BTreeMap<String, Value>>,
    spec: &GroupSpec,
) -> Result<Vec<BTreeMap<String, Value>>, String> {
    let mut groups: BTreeMap<Value, Vec<BTreeMap<String, Value>>> = BTreeMap::new();
    for row in rows {
        let key = match &spec.id_field {
            Some(field) => get_path(&row, field).cloned().unwrap_or(Value::Null),
            None => Value::Null,
        };
        groups.entry(key).or_default().push(row);
    }

    let mut output = Vec::with_capacity(groups.len());
    for (key, group_rows) in groups {
        let mut out_row = BTreeMap::new();
        out_row.insert("_id".to_string(), key);
        for (out_field, agg) in &spec.aggregations {
            out_row.insert(out_field.clone(), compute_agg(agg, &group_rows));
        }
        output.push(out_row);
    }
    Ok(output)
}

/// Aggregations tolerate rows where the operand field is absent or the
/// wrong kind: they simply contribute nothing, mirroring the filter
/// engine's absent-field-never-errors stance (spec §4.5/§4.7).
fn compute_agg(agg: &AggSpec, rows: &[BTreeMap<String, Value>]) -> Value {
    match agg {
        AggSpec::Count => Value::Int(rows.len() as i64),
        AggSpec::Sum(field) => {
            let total: f64 = rows.iter().filter_map(|r| get_path(r, field).and_then(|v| v.as_f64())).sum();
            Value::Float(total)
        }
        AggSpec::Avg(field) => {
            let nums: Vec<f64> = rows
                .iter()
                .filter_map(|r| get_path(r, field).and_then(|v| v.as_f64()))
                .collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Float(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggSpec::Min(field) => rows
            .iter()
            .filter_map(|r| get_path(r, field).cloned())
            .min()
            .unwrap_or(Value::Null),
        AggSpec::Max(field) => rows
            .iter()
            .filter_map(|r| get_path(r, field).cloned())
            .max()
            .unwrap_or(Value::Null),
        AggSpec::First(field) => rows.first().and_then(|r| get_path(r, field).cloned()).unwrap_or(Value::Null),
        AggSpec::Last(field) => rows.last().and_then(|r| get_path(r, field).cloned()).unwrap_or(Value::Null),
        AggSpec::Push(field) => {
            Value::List(rows.iter().filter_map(|r| get_path(r, field).cloned()).collect())
        }
        AggSpec::AddToSet(field) => {
            let mut seen: Vec<Value> = Vec::new();
            for r in rows {
                if let Some(v) = get_path(r, field) {
                    if !seen.contains(v) {
                        seen.push(v.clone());
                    }
                }
            }
            Value::List(seen)
        }
    }
}

/// Distinguishes a stage-index-scoped parse failure from the spec's
/// standalone `InvalidProjection` error, which names its own kind rather
/// than being reported as "stage N failed" (spec §4.7/§7).
enum StageParseError {
    Generic(String),
    InvalidProjection(String),
}

impl From<String> for StageParseError {
    fn from(message: String) -> Self {
        StageParseError::Generic(message)
    }
}

impl From<&str> for StageParseError {
    fn from(message: &str) -> Self {
        StageParseError::Generic(message.to_string())
    }
}

pub fn parse_pipeline(json: &Json) -> Result<Vec<Stage>, Error> {
    let arr = json
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("pipeline must be a JSON array".into()))?;

    arr.iter()
        .enumerate()
        .map(|(index, stage_json)| {
            parse_stage(stage_json).map_err(|e| match e {
                StageParseError::InvalidProjection(message) => Error::InvalidProjection(message),
                StageParseError::Generic(message) => Error::AggregationStageException { stage: index, message },
            })
        })
        .collect()
}

fn parse_stage(json: &Json) -> Result<Stage, StageParseError> {
    let obj = json.as_object().ok_or("stage must be a JSON object")?;
    if obj.len() != 1 {
        return Err("stage object must have exactly one key".into());
    }
    let (name, value) = obj.iter().next().unwrap();

    match name.as_str() {
        "match" => Ok(Stage::Match(parse_filter(value).map_err(|e| e.to_string())?)),
        "project" => Ok(Stage::Project(parse_projection(value)?)),
        "sort" => Ok(Stage::Sort(parse_sort(value).map_err(|e| e.to_string())?)),
        "skip" => Ok(Stage::Skip(
            value.as_u64().ok_or("skip value must be a non-negative integer")? as usize,
        )),
        "limit" => Ok(Stage::Limit(
            value.as_u64().ok_or("limit value must be a non-negative integer")? as usize,
        )),
        "group" => parse_group(value),
        other => Err(format!("unknown stage: {other}").into()),
    }
}

/// `{field: true, ...}` is pure inclusion, `{field: false, ...}` is pure
/// exclusion; mixing the two among non-`_id` fields is `InvalidProjection`.
/// `_id`'s own flag is tracked separately since it's included by default
/// regardless of the other fields' mode (spec §4.7).
fn parse_projection(json: &Json) -> Result<Projection, StageParseError> {
    let obj = json.as_object().ok_or("project value must be an object")?;

    let mut include_id = true;
    let mut fields = Vec::new();
    let mut saw_include = false;
    let mut saw_exclude = false;

    for (field, spec) in obj {
        let flag = spec
            .as_bool()
            .ok_or_else(|| format!("project field '{field}' must be a boolean"))?;
        if field == ID_FIELD {
            include_id = flag;
            continue;
        }
        if flag {
            saw_include = true;
        } else {
            saw_exclude = true;
        }
        fields.push(field.clone());
    }

    if saw_include && saw_exclude {
        return Err(StageParseError::InvalidProjection(
            "project cannot mix field inclusion and exclusion".to_string(),
        ));
    }

    Ok(Projection { include: !saw_exclude, include_id, fields })
}

/// Strips the leading `$` spec §4.7 requires on field path references
/// (distinguishing a path from a literal), so `get_path` sees the bare
/// field name it expects.
fn strip_path_marker(field: &str) -> String {
    field.strip_prefix('$').unwrap_or(field).to_string()
}

fn parse_group(json: &Json) -> Result<Stage, StageParseError> {
    let obj = json.as_object().ok_or("group value must be an object")?;
    let id_field = match obj.get("by") {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) => Some(strip_path_marker(s)),
        Some(_) => return Err("group 'by' must be a string field name".into()),
    };

    let aggregations_obj = obj
        .get("aggregations")
        .and_then(|v| v.as_object())
        .ok_or("group missing 'aggregations' object")?;

    let mut aggregations = Vec::with_capacity(aggregations_obj.len());
    for (out_field, spec_json) in aggregations_obj {
        let spec_obj = spec_json.as_object().ok_or("aggregation spec must be an object")?;
        let op = spec_obj.get("op").and_then(|v| v.as_str()).ok_or("aggregation spec missing 'op'")?;
        let field = || {
            spec_obj
                .get("field")
                .and_then(|v| v.as_str())
                .map(strip_path_marker)
                .ok_or_else(|| format!("'{op}' requires 'field'"))
        };
        let agg = match op {
            "sum" => AggSpec::Sum(field()?),
            "avg" => AggSpec::Avg(field()?),
            "min" => AggSpec::Min(field()?),
            "max" => AggSpec::Max(field()?),
            "count" => AggSpec::Count,
            "first" => AggSpec::First(field()?),
            "last" => AggSpec::Last(field()?),
            "push" => AggSpec::Push(field()?),
            "add_to_set" => AggSpec::AddToSet(field()?),
            other => return Err(format!("unknown aggregation operator: {other}").into()),
        };
        aggregations.push((out_field.clone(), agg));
    }

    Ok(Stage::Group(GroupSpec { id_field, aggregations }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn match_then_limit() {
        let rows = vec![
            row(&[("team", Value::String("a".into())), ("score", Value::Int(10))]),
            row(&[("team", Value::String("b".into())), ("score", Value::Int(20))]),
            row(&[("team", Value::String("a".into())), ("score", Value::Int(30))]),
        ];
        let stages = vec![
            Stage::Match(Filter::Eq("team".into(), Value::String("a".into()))),
            Stage::Limit(1),
        ];
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn group_sums_per_key() {
        let rows = vec![
            row(&[("team", Value::String("a".into())), ("score", Value::Int(10))]),
            row(&[("team", Value::String("a".into())), ("score", Value::Int(5))]),
            row(&[("team", Value::String("b".into())), ("score", Value::Int(7))]),
        ];
        let stages = vec![Stage::Group(GroupSpec {
            id_field: Some("team".to_string()),
            aggregations: vec![("total".to_string(), AggSpec::Sum("score".to_string()))],
        })];
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result.len(), 2);
        let a = result.iter().find(|r| r["_id"] == Value::String("a".into())).unwrap();
        assert_eq!(a["total"], Value::Float(15.0));
    }

    #[test]
    fn group_with_no_key_aggregates_everything() {
        let rows = vec![row(&[("score", Value::Int(1))]), row(&[("score", Value::Int(2))])];
        let stages = vec![Stage::Group(GroupSpec {
            id_field: None,
            aggregations: vec![("count".to_string(), AggSpec::Count)],
        })];
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["count"], Value::Int(2));
    }

    #[test]
    fn unknown_stage_reports_stage_index() {
        let pipeline = json!([{ "match": { "a": 1 } }, { "bogus": {} }]);
        let err = parse_pipeline(&pipeline).unwrap_err();
        match err {
            Error::AggregationStageException { stage, message } => {
                assert_eq!(stage, 1);
                assert!(message.contains("unknown stage"));
            }
            other => panic!("expected AggregationStageException, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_between_stages_is_observed() {
        let rows = vec![row(&[("a", Value::Int(1))])];
        let stages = vec![Stage::Match(Filter::Exists("a".into(), true)), Stage::Limit(1)];
        let calls = std::cell::Cell::new(0);
        let is_cancelled = || {
            calls.set(calls.get() + 1);
            calls.get() > 1
        };
        let err = execute_cancellable(rows, &stages, &is_cancelled).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn parse_pipeline_builds_group_stage_from_json() {
        let pipeline = json!([
            { "group": { "by": "team", "aggregations": { "total": { "op": "sum", "field": "score" } } } }
        ]);
        let stages = parse_pipeline(&pipeline).unwrap();
        assert_eq!(stages.len(), 1);
        assert!(matches!(&stages[0], Stage::Group(spec) if spec.id_field.as_deref() == Some("team")));
    }

    #[test]
    fn match_group_sort_limit_pipeline_with_dollar_field_paths() {
        let rows = vec![
            row(&[("category", Value::String("A".into())), ("value", Value::Int(10))]),
            row(&[("category", Value::String("B".into())), ("value", Value::Int(20))]),
            row(&[("category", Value::String("A".into())), ("value", Value::Int(30))]),
            row(&[("category", Value::String("B".into())), ("value", Value::Int(40))]),
            row(&[("category", Value::String("C".into())), ("value", Value::Int(50))]),
        ];
        let pipeline = json!([
            { "match": { "value": { "$gte": 20 } } },
            { "group": { "by": "$category", "aggregations": {
                "total": { "op": "sum", "field": "$value" },
                "count": { "op": "count" }
            } } },
            { "sort": [{ "field": "total", "direction": "desc" }] },
            { "limit": 2 },
        ]);
        let stages = parse_pipeline(&pipeline).unwrap();
        let result = execute(rows, &stages).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["_id"], Value::String("B".into()));
        assert_eq!(result[0]["total"], Value::Float(60.0));
        assert_eq!(result[0]["count"], Value::Int(2));
        assert_eq!(result[1]["_id"], Value::String("C".into()));
        assert_eq!(result[1]["total"], Value::Float(50.0));
        assert_eq!(result[1]["count"], Value::Int(1));
    }

    #[test]
    fn project_inclusion_keeps_id_by_default() {
        let rows = vec![row(&[
            ("name", Value::String("Acme".into())),
            ("secret", Value::String("shh".into())),
        ])];
        let pipeline = json!([{ "project": { "name": true } }]);
        let stages = parse_pipeline(&pipeline).unwrap();
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result[0].len(), 1);
        assert_eq!(result[0].get("name"), Some(&Value::String("Acme".into())));
    }

    #[test]
    fn project_exclusion_drops_named_fields_only() {
        let rows = vec![row(&[
            ("name", Value::String("Acme".into())),
            ("secret", Value::String("shh".into())),
        ])];
        let pipeline = json!([{ "project": { "secret": false } }]);
        let stages = parse_pipeline(&pipeline).unwrap();
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result[0].get("name"), Some(&Value::String("Acme".into())));
        assert_eq!(result[0].get("secret"), None);
    }

    #[test]
    fn project_explicit_id_exclusion_is_honored() {
        let rows = vec![row(&[("_id", Value::String("doc1".into())), ("name", Value::String("Acme".into()))])];
        let pipeline = json!([{ "project": { "name": true, "_id": false } }]);
        let stages = parse_pipeline(&pipeline).unwrap();
        let result = execute(rows, &stages).unwrap();
        assert_eq!(result[0].get("_id"), None);
        assert_eq!(result[0].get("name"), Some(&Value::String("Acme".into())));
    }

    #[test]
    fn project_mixing_inclusion_and_exclusion_is_invalid_projection() {
        let pipeline = json!([{ "project": { "name": true, "secret": false } }]);
        let err = parse_pipeline(&pipeline).unwrap_err();
        assert!(matches!(err, Error::InvalidProjection(_)));
    }

    #[test]
    fn run_pipeline_reports_stage_failure_without_panicking() {
        let rows = vec![row(&[("a", Value::Int(1))])];
        let pipeline = json!([{ "bogus": {} }]);
        let stages = parse_pipeline(&pipeline);
        assert!(stages.is_err());

        let result = run_pipeline(rows, &[]);
        assert!(result.success);
        assert_eq!(result.stages_executed, 0);
    }
}
