//! Executes an [`OperationPlan`] against a [`ResolverContext`].
//!
//! Query root fields, sibling fields and list items are driven with
//! `join_all` under [`ResolverContext::drive`], so every `Post.user` lookup of
//! one operation lands in the same batch window. Mutation root fields run one
//! after another.

use std::sync::Mutex;

use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::{Map, Value};
use unigraph_contracts::GatewayError;

use super::document::{FieldNode, OperationKind, OperationPlan};
use super::introspection;
use super::resolvers::ResolverContext;
use super::schema::{Schema, TypeKind, TypeRef, schema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(idx) => write!(f, "{}", idx),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub error: GatewayError,
    pub path: Vec<PathSegment>,
}

impl FieldError {
    pub fn dotted_path(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// `None` when a null reached the root.
    pub data: Option<Value>,
    pub errors: Vec<FieldError>,
}

/// A non-null field came back null; the nearest nullable ancestor absorbs it.
struct Propagate;

type Completion<'a> = BoxFuture<'a, Result<Value, Propagate>>;

pub async fn execute(plan: &OperationPlan, ctx: &ResolverContext) -> ExecutionOutcome {
    let execution = Execution {
        schema: schema(),
        ctx,
        errors: Mutex::new(Vec::new()),
    };

    let root = Value::Object(Map::new());
    let serial = plan.kind == OperationKind::Mutation;
    let fields = execution.execute_fields(
        plan.kind.root_type(),
        &root,
        &plan.fields,
        Vec::new(),
        serial,
    );
    let data = ctx.drive(fields).await.ok();

    ExecutionOutcome {
        data,
        errors: execution.into_errors(),
    }
}

struct Execution<'c> {
    schema: &'static Schema,
    ctx: &'c ResolverContext,
    errors: Mutex<Vec<FieldError>>,
}

impl<'c> Execution<'c> {
    fn execute_fields<'a>(
        &'a self,
        parent_type: &'static str,
        parent: &'a Value,
        fields: &'a [FieldNode],
        path: Vec<PathSegment>,
        serial: bool,
    ) -> Completion<'a> {
        Box::pin(async move {
            let results = if serial {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(self.execute_field(parent_type, parent, field, path.clone()).await);
                }
                out
            } else {
                join_all(
                    fields
                        .iter()
                        .map(|field| self.execute_field(parent_type, parent, field, path.clone())),
                )
                .await
            };

            let mut object = Map::new();
            for (field, result) in fields.iter().zip(results) {
                object.insert(field.response_key.clone(), result?);
            }
            Ok(Value::Object(object))
        })
    }

    fn execute_field<'a>(
        &'a self,
        parent_type: &'static str,
        parent: &'a Value,
        field: &'a FieldNode,
        mut path: Vec<PathSegment>,
    ) -> Completion<'a> {
        Box::pin(async move {
            path.push(PathSegment::Key(field.response_key.clone()));
            match self.ctx.resolve(parent_type, parent, field).await {
                Ok(value) => self.complete_value(&field.ty, field, value, path).await,
                Err(error) => {
                    self.record(error, path);
                    if field.ty.is_non_null() {
                        Err(Propagate)
                    } else {
                        Ok(Value::Null)
                    }
                }
            }
        })
    }

    fn complete_value<'a>(
        &'a self,
        ty: &'a TypeRef,
        field: &'a FieldNode,
        value: Value,
        path: Vec<PathSegment>,
    ) -> Completion<'a> {
        Box::pin(async move {
            match ty {
                TypeRef::NonNull(inner) => {
                    if value.is_null() {
                        self.record(
                            GatewayError::Internal(format!(
                                "Cannot return null for non-nullable field {}.{}.",
                                field.parent_type, field.name
                            )),
                            path,
                        );
                        return Err(Propagate);
                    }
                    // A null here means a descendant already recorded its error.
                    match self.complete_value(inner, field, value, path).await? {
                        Value::Null => Err(Propagate),
                        completed => Ok(completed),
                    }
                }
                _ if value.is_null() => Ok(Value::Null),
                TypeRef::List(inner) => {
                    let Value::Array(items) = value else {
                        self.record(
                            GatewayError::Internal(format!(
                                "Expected a list for field {}.{}.",
                                field.parent_type, field.name
                            )),
                            path,
                        );
                        return Ok(Value::Null);
                    };
                    let completions = items.into_iter().enumerate().map(|(idx, item)| {
                        let mut item_path = path.clone();
                        item_path.push(PathSegment::Index(idx));
                        self.complete_value(inner, field, item, item_path)
                    });

                    let mut out = Vec::new();
                    for completed in join_all(completions).await {
                        match completed {
                            Ok(item) => out.push(item),
                            Err(Propagate) => return Ok(Value::Null),
                        }
                    }
                    Ok(Value::Array(out))
                }
                TypeRef::Named(name) => {
                    let name: &'static str = *name;
                    let kind = self.schema.get(name).map(|def| def.kind);
                    match kind {
                        Some(TypeKind::Object) => {
                            let value = if name == "__Type" {
                                introspection::expand(self.schema, value)
                            } else {
                                value
                            };
                            let completed = self
                                .execute_fields(name, &value, &field.selection, path, false)
                                .await;
                            Ok(completed.unwrap_or(Value::Null))
                        }
                        Some(TypeKind::Scalar) => Ok(coerce_scalar(name, value)),
                        Some(TypeKind::Enum) => Ok(value),
                        None => {
                            self.record(
                                GatewayError::Internal(format!("unknown type {}", name)),
                                path,
                            );
                            Ok(Value::Null)
                        }
                    }
                }
            }
        })
    }

    fn record(&self, error: GatewayError, path: Vec<PathSegment>) {
        tracing::debug!(code = %error.code(), error = %error, "gateway.field_error");
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.push(FieldError { error, path });
    }

    fn into_errors(self) -> Vec<FieldError> {
        match self.errors.into_inner() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn coerce_scalar(name: &str, value: Value) -> Value {
    match (name, value) {
        ("ID" | "String", Value::Number(n)) => Value::String(n.to_string()),
        ("String", Value::Bool(b)) => Value::String(b.to_string()),
        ("Int", Value::String(s)) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        (_, other) => other,
    }
}
