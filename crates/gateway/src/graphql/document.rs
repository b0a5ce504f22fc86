//! Lowers a parsed GraphQL document into an [`OperationPlan`]: the selected
//! operation with fragments inlined, directives applied, variables resolved
//! and every field checked against the schema.

use std::collections::{BTreeSet, HashMap, HashSet};

use graphql_parser::query::{
    Definition, Directive, Field, FragmentDefinition, OperationDefinition, Selection,
    SelectionSet, Type as AstType, TypeCondition, Value as AstValue, VariableDefinition,
};
use serde_json::{Map, Value};
use unigraph_contracts::GatewayError;

use super::schema::{FieldDef, MUTATION_TYPE, QUERY_TYPE, Schema, TypeKind, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }

    pub fn root_type(self) -> &'static str {
        match self {
            OperationKind::Query => QUERY_TYPE,
            OperationKind::Mutation => MUTATION_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldNode {
    pub response_key: String,
    pub name: String,
    pub parent_type: &'static str,
    pub ty: TypeRef,
    pub arguments: Map<String, Value>,
    pub selection: Vec<FieldNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationPlan {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub fields: Vec<FieldNode>,
}

impl OperationPlan {
    pub fn references_introspection(&self) -> bool {
        let mut found = false;
        visit(&self.fields, &mut |f| {
            found |= is_introspection_root(&f.name);
        });
        found
    }

    /// Every field name the operation selects, at any depth.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        visit(&self.fields, &mut |f| {
            names.insert(f.name.clone());
        });
        names
    }
}

fn is_introspection_root(name: &str) -> bool {
    name == "__schema" || name == "__type"
}

fn visit(fields: &[FieldNode], f: &mut dyn FnMut(&FieldNode)) {
    for field in fields {
        f(field);
        visit(&field.selection, f);
    }
}

/// Bounds applied while fragments are inlined, before any validation rule
/// sees the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    /// Field nodes lowering may produce; exceeding it is `ComplexityExceeded`.
    pub max_nodes: u64,
    /// When false, `__schema` and `__type` are planned without their
    /// selections. The introspection gate rejects such plans.
    pub expand_introspection: bool,
}

impl PlanLimits {
    pub const UNBOUNDED: PlanLimits = PlanLimits {
        max_nodes: u64::MAX,
        expand_introspection: true,
    };
}

pub fn plan_operation(
    schema: &'static Schema,
    query: &str,
    operation_name: Option<&str>,
    variables: Option<&Map<String, Value>>,
) -> Result<OperationPlan, GatewayError> {
    plan_operation_with(schema, query, operation_name, variables, PlanLimits::UNBOUNDED)
}

pub fn plan_operation_with(
    schema: &'static Schema,
    query: &str,
    operation_name: Option<&str>,
    variables: Option<&Map<String, Value>>,
    limits: PlanLimits,
) -> Result<OperationPlan, GatewayError> {
    let document = graphql_parser::parse_query::<String>(query)
        .map_err(|err| GatewayError::Syntax(format!("Syntax Error: {}", err).trim().to_string()))?;

    let mut operations = Vec::new();
    let mut fragments = HashMap::new();
    for definition in &document.definitions {
        match definition {
            Definition::Operation(op) => operations.push(op),
            Definition::Fragment(fragment) => {
                if fragments.insert(fragment.name.as_str(), fragment).is_some() {
                    return Err(GatewayError::InvalidOperation(format!(
                        "There can be only one fragment named \"{}\".",
                        fragment.name
                    )));
                }
            }
        }
    }

    let operation = select_operation(&operations, operation_name)?;
    let (kind, name, variable_definitions, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name.clone(),
            &q.variable_definitions[..],
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name.clone(),
            &m.variable_definitions[..],
            &m.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            return Err(GatewayError::InvalidOperation(
                "Subscriptions are not supported.".to_string(),
            ));
        }
    };

    let declared = variable_definitions
        .iter()
        .map(|def| def.name.clone())
        .collect::<HashSet<_>>();
    let values = coerce_variables(schema, variable_definitions, variables)?;

    let mut lowering = Lowering {
        schema,
        fragments: &fragments,
        declared: &declared,
        variables: &values,
        spread_stack: Vec::new(),
        limits,
        nodes: 0,
    };
    let fields = lowering.selection_set(kind.root_type(), selection_set)?;

    Ok(OperationPlan { kind, name, fields })
}

fn operation_name<'d>(op: &'d OperationDefinition<'_, String>) -> Option<&'d str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn select_operation<'d, 'a>(
    operations: &[&'d OperationDefinition<'a, String>],
    requested: Option<&str>,
) -> Result<&'d OperationDefinition<'a, String>, GatewayError> {
    if operations.is_empty() {
        return Err(GatewayError::InvalidOperation(
            "Document does not contain an operation.".to_string(),
        ));
    }

    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => operations
            .iter()
            .copied()
            .find(|op| operation_name(op) == Some(name))
            .ok_or_else(|| {
                GatewayError::InvalidOperation(format!("Unknown operation named \"{}\".", name))
            }),
        None if operations.len() == 1 => Ok(operations[0]),
        None => Err(GatewayError::InvalidOperation(
            "Must provide operation name if query contains multiple operations.".to_string(),
        )),
    }
}

fn type_ref_from_ast(schema: &Schema, ty: &AstType<'_, String>) -> Result<TypeRef, GatewayError> {
    Ok(match ty {
        AstType::NamedType(name) => {
            let def = schema.get(name).ok_or_else(|| {
                GatewayError::InvalidOperation(format!("Unknown type \"{}\".", name))
            })?;
            TypeRef::Named(def.name)
        }
        AstType::ListType(inner) => TypeRef::List(Box::new(type_ref_from_ast(schema, inner)?)),
        AstType::NonNullType(inner) => {
            TypeRef::NonNull(Box::new(type_ref_from_ast(schema, inner)?))
        }
    })
}

fn coerce_variables(
    schema: &Schema,
    definitions: &[VariableDefinition<'_, String>],
    provided: Option<&Map<String, Value>>,
) -> Result<HashMap<String, Value>, GatewayError> {
    let mut values = HashMap::new();

    for def in definitions {
        let ty = type_ref_from_ast(schema, &def.var_type)?;
        let value = match provided.and_then(|vars| vars.get(&def.name)) {
            Some(value) => Some(value.clone()),
            None => def
                .default_value
                .as_ref()
                .map(|default| {
                    convert_value(default, &|name| {
                        Err(GatewayError::InvalidOperation(format!(
                            "Variable \"${}\" cannot be used in a default value.",
                            name
                        )))
                    })
                })
                .transpose()?
                .flatten(),
        };

        match value {
            None | Some(Value::Null) if ty.is_non_null() => {
                return Err(GatewayError::BadUserInput(format!(
                    "Variable \"${}\" of required type \"{}\" was not provided.",
                    def.name, ty
                )));
            }
            None => {}
            Some(value) => {
                check_input(schema, &ty, &value).map_err(|reason| {
                    GatewayError::BadUserInput(format!(
                        "Variable \"${}\" got invalid value {}; {}",
                        def.name, value, reason
                    ))
                })?;
                values.insert(def.name.clone(), value);
            }
        }
    }

    Ok(values)
}

fn convert_value(
    value: &AstValue<'_, String>,
    variable: &dyn Fn(&str) -> Result<Option<Value>, GatewayError>,
) -> Result<Option<Value>, GatewayError> {
    Ok(Some(match value {
        AstValue::Variable(name) => return variable(name),
        AstValue::Int(n) => n.as_i64().map(Value::from).unwrap_or(Value::Null),
        AstValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AstValue::String(s) => Value::String(s.clone()),
        AstValue::Boolean(b) => Value::Bool(*b),
        AstValue::Null => Value::Null,
        AstValue::Enum(e) => Value::String(e.clone()),
        AstValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(convert_value(item, variable)?.unwrap_or(Value::Null));
            }
            Value::Array(out)
        }
        AstValue::Object(entries) => {
            let mut out = Map::new();
            for (key, item) in entries {
                if let Some(v) = convert_value(item, variable)? {
                    out.insert(key.clone(), v);
                }
            }
            Value::Object(out)
        }
    }))
}

/// Input coercion check for the scalar-only argument types the schema uses.
fn check_input(schema: &Schema, ty: &TypeRef, value: &Value) -> Result<(), String> {
    match ty {
        TypeRef::NonNull(inner) => {
            if value.is_null() {
                return Err(format!("Expected non-nullable type \"{}\" not to be null.", ty));
            }
            check_input(schema, inner, value)
        }
        _ if value.is_null() => Ok(()),
        TypeRef::List(inner) => match value {
            Value::Array(items) => items
                .iter()
                .try_for_each(|item| check_input(schema, inner, item)),
            single => check_input(schema, inner, single),
        },
        TypeRef::Named(name) => {
            let ok = match *name {
                "Int" => value
                    .as_i64()
                    .is_some_and(|n| i32::try_from(n).is_ok()),
                "Float" => value.is_number(),
                "String" => value.is_string(),
                "Boolean" => value.is_boolean(),
                "ID" => value.is_string() || value.is_i64() || value.is_u64(),
                other => {
                    return match schema.get(other).map(|t| t.kind) {
                        Some(TypeKind::Enum) => Ok(()),
                        _ => Err(format!("\"{}\" is not an input type.", other)),
                    };
                }
            };
            if ok {
                Ok(())
            } else {
                Err(format!("{} cannot represent value: {}", name, value))
            }
        }
    }
}

struct Lowering<'d, 'a> {
    schema: &'static Schema,
    fragments: &'d HashMap<&'d str, &'d FragmentDefinition<'a, String>>,
    declared: &'d HashSet<String>,
    variables: &'d HashMap<String, Value>,
    spread_stack: Vec<String>,
    limits: PlanLimits,
    nodes: u64,
}

impl<'d, 'a> Lowering<'d, 'a> {
    fn selection_set(
        &mut self,
        parent: &'static str,
        set: &SelectionSet<'a, String>,
    ) -> Result<Vec<FieldNode>, GatewayError> {
        let mut out = Vec::new();
        self.collect(parent, set, &mut out)?;
        Ok(out)
    }

    fn collect(
        &mut self,
        parent: &'static str,
        set: &SelectionSet<'a, String>,
        out: &mut Vec<FieldNode>,
    ) -> Result<(), GatewayError> {
        for item in &set.items {
            match item {
                Selection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    let node = self.field(parent, field)?;
                    merge_field(out, node)?;
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragments = self.fragments;
                    let fragment = fragments.get(name).ok_or_else(|| {
                        GatewayError::InvalidOperation(format!("Unknown fragment \"{}\".", name))
                    })?;
                    if self.spread_stack.iter().any(|active| active == name) {
                        return Err(GatewayError::InvalidOperation(format!(
                            "Cannot spread fragment \"{}\" within itself.",
                            name
                        )));
                    }
                    self.check_type_condition(parent, &fragment.type_condition)?;

                    self.spread_stack.push(name.to_string());
                    let result = self.collect(parent, &fragment.selection_set, out);
                    self.spread_stack.pop();
                    result?;
                }
                Selection::InlineFragment(inline) => {
                    if !self.included(&inline.directives)? {
                        continue;
                    }
                    if let Some(condition) = &inline.type_condition {
                        self.check_type_condition(parent, condition)?;
                    }
                    self.collect(parent, &inline.selection_set, out)?;
                }
            }
        }
        Ok(())
    }

    fn field(
        &mut self,
        parent: &'static str,
        field: &Field<'a, String>,
    ) -> Result<FieldNode, GatewayError> {
        self.nodes += 1;
        if self.nodes > self.limits.max_nodes {
            return Err(GatewayError::ComplexityExceeded {
                limit: self.limits.max_nodes,
                observed: self.nodes,
            });
        }

        let def = self.schema.field(parent, &field.name).ok_or_else(|| {
            GatewayError::InvalidOperation(format!(
                "Cannot query field \"{}\" on type \"{}\".",
                field.name, parent
            ))
        })?;
        let arguments = self.arguments(parent, def, &field.arguments)?;

        let target = self.schema.get(def.ty.named_type()).ok_or_else(|| {
            GatewayError::Internal(format!("type {} missing from schema", def.ty.named_type()))
        })?;
        let has_subselection = !field.selection_set.items.is_empty();
        let stub = !self.limits.expand_introspection && is_introspection_root(&field.name);
        let selection = match (target.is_composite(), has_subselection) {
            (true, true) if stub => Vec::new(),
            (true, true) => self.selection_set(target.name, &field.selection_set)?,
            (false, false) => Vec::new(),
            (true, false) => {
                return Err(GatewayError::InvalidOperation(format!(
                    "Field \"{}\" of type \"{}\" must have a selection of subfields.",
                    field.name, def.ty
                )));
            }
            (false, true) => {
                return Err(GatewayError::InvalidOperation(format!(
                    "Field \"{}\" must not have a selection since type \"{}\" has no subfields.",
                    field.name, def.ty
                )));
            }
        };

        Ok(FieldNode {
            response_key: field.alias.clone().unwrap_or_else(|| field.name.clone()),
            name: field.name.clone(),
            parent_type: parent,
            ty: def.ty.clone(),
            arguments,
            selection,
        })
    }

    fn arguments(
        &self,
        parent: &str,
        def: &FieldDef,
        given: &[(String, AstValue<'a, String>)],
    ) -> Result<Map<String, Value>, GatewayError> {
        let mut out = Map::new();

        for (name, raw) in given {
            let arg = def.args.iter().find(|a| a.name == name).ok_or_else(|| {
                GatewayError::InvalidOperation(format!(
                    "Unknown argument \"{}\" on field \"{}.{}\".",
                    name, parent, def.name
                ))
            })?;
            let Some(value) = self.value(raw)? else {
                continue;
            };
            check_input(self.schema, &arg.ty, &value).map_err(|reason| {
                GatewayError::BadUserInput(format!(
                    "Argument \"{}\" on field \"{}.{}\" has invalid value: {}",
                    name, parent, def.name, reason
                ))
            })?;
            out.insert(name.clone(), value);
        }

        for arg in &def.args {
            if out.contains_key(arg.name) {
                continue;
            }
            if let Some(default) = &arg.default {
                out.insert(arg.name.to_string(), default.clone());
            } else if arg.ty.is_non_null() {
                return Err(GatewayError::InvalidOperation(format!(
                    "Field \"{}.{}\" argument \"{}\" of type \"{}\" is required, but it was not provided.",
                    parent, def.name, arg.name, arg.ty
                )));
            }
        }

        Ok(out)
    }

    fn value(&self, raw: &AstValue<'a, String>) -> Result<Option<Value>, GatewayError> {
        convert_value(raw, &|name| {
            if !self.declared.contains(name) {
                return Err(GatewayError::BadUserInput(format!(
                    "Variable \"${}\" is not defined.",
                    name
                )));
            }
            Ok(self.variables.get(name).cloned())
        })
    }

    fn included(&self, directives: &[Directive<'a, String>]) -> Result<bool, GatewayError> {
        for directive in directives {
            let skip_when = match directive.name.as_str() {
                "skip" => true,
                "include" => false,
                other => {
                    return Err(GatewayError::InvalidOperation(format!(
                        "Unknown directive \"@{}\".",
                        other
                    )));
                }
            };
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| self.value(value))
                .transpose()?
                .flatten()
                .and_then(|v| v.as_bool())
                .ok_or_else(|| {
                    GatewayError::BadUserInput(format!(
                        "Directive \"@{}\" requires a Boolean \"if\" argument.",
                        directive.name
                    ))
                })?;
            if condition == skip_when {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_type_condition(
        &self,
        parent: &str,
        condition: &TypeCondition<'a, String>,
    ) -> Result<(), GatewayError> {
        let TypeCondition::On(name) = condition;
        if self.schema.get(name).is_none() {
            return Err(GatewayError::InvalidOperation(format!(
                "Unknown type \"{}\".",
                name
            )));
        }
        if name != parent {
            return Err(GatewayError::InvalidOperation(format!(
                "Fragment cannot be spread here as objects of type \"{}\" can never be of type \"{}\".",
                parent, name
            )));
        }
        Ok(())
    }
}

fn merge_field(out: &mut Vec<FieldNode>, node: FieldNode) -> Result<(), GatewayError> {
    match out.iter_mut().find(|f| f.response_key == node.response_key) {
        None => out.push(node),
        Some(existing) => {
            if existing.name != node.name || existing.arguments != node.arguments {
                return Err(GatewayError::InvalidOperation(format!(
                    "Fields \"{}\" conflict because they have differing names or arguments.",
                    node.response_key
                )));
            }
            for child in node.selection {
                merge_field(&mut existing.selection, child)?;
            }
        }
    }
    Ok(())
}
