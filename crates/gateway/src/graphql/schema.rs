//! Static type system for the gateway schema, including the introspection
//! meta types.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Named(&'static str),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named_type(&self) -> &'static str {
        match self {
            TypeRef::Named(name) => *name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// True when the outermost non-null-stripped type is a list.
    pub fn is_list(&self) -> bool {
        match self {
            TypeRef::List(_) => true,
            TypeRef::NonNull(inner) => inner.is_list(),
            TypeRef::Named(_) => false,
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

fn named(name: &'static str) -> TypeRef {
    TypeRef::Named(name)
}

fn non_null(inner: TypeRef) -> TypeRef {
    TypeRef::NonNull(Box::new(inner))
}

fn list(inner: TypeRef) -> TypeRef {
    TypeRef::List(Box::new(inner))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Enum,
}

impl TypeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeKind::Scalar => "SCALAR",
            TypeKind::Object => "OBJECT",
            TypeKind::Enum => "ENUM",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgDef {
    pub name: &'static str,
    pub ty: TypeRef,
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: TypeRef,
    pub args: Vec<ArgDef>,
    pub description: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: &'static str,
    pub kind: TypeKind,
    pub description: Option<&'static str>,
    pub fields: Vec<FieldDef>,
    pub enum_values: Vec<&'static str>,
}

impl TypeDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_composite(&self) -> bool {
        self.kind == TypeKind::Object
    }
}

#[derive(Debug)]
pub struct Schema {
    types: BTreeMap<&'static str, TypeDef>,
}

pub const QUERY_TYPE: &str = "Query";
pub const MUTATION_TYPE: &str = "Mutation";

impl Schema {
    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Looks a field up on `type_name`, including `__typename` and the
    /// root-only meta fields.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        match field_name {
            "__typename" => Some(&TYPENAME_FIELD),
            "__schema" if type_name == QUERY_TYPE => Some(&SCHEMA_FIELD),
            "__type" if type_name == QUERY_TYPE => Some(&TYPE_FIELD),
            _ => self.get(type_name)?.field(field_name),
        }
    }
}

static TYPENAME_FIELD: LazyLock<FieldDef> =
    LazyLock::new(|| field("__typename", non_null(named("String"))));

static SCHEMA_FIELD: LazyLock<FieldDef> =
    LazyLock::new(|| field("__schema", non_null(named("__Schema"))));

static TYPE_FIELD: LazyLock<FieldDef> = LazyLock::new(|| {
    field("__type", named("__Type")).arg("name", non_null(named("String")), None)
});

static SCHEMA: LazyLock<Schema> = LazyLock::new(build_schema);

pub fn schema() -> &'static Schema {
    &SCHEMA
}

fn field(name: &'static str, ty: TypeRef) -> FieldDef {
    FieldDef {
        name,
        ty,
        args: Vec::new(),
        description: None,
    }
}

impl FieldDef {
    fn arg(mut self, name: &'static str, ty: TypeRef, default: Option<Value>) -> Self {
        self.args.push(ArgDef { name, ty, default });
        self
    }

    fn describe(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

fn object(name: &'static str, description: Option<&'static str>, fields: Vec<FieldDef>) -> TypeDef {
    TypeDef {
        name,
        kind: TypeKind::Object,
        description,
        fields,
        enum_values: Vec::new(),
    }
}

fn scalar(name: &'static str) -> TypeDef {
    TypeDef {
        name,
        kind: TypeKind::Scalar,
        description: None,
        fields: Vec::new(),
        enum_values: Vec::new(),
    }
}

fn build_schema() -> Schema {
    let id = || non_null(named("ID"));
    let string = || named("String");
    let string_nn = || non_null(named("String"));
    let int_nn = || non_null(named("Int"));
    let bool_nn = || non_null(named("Boolean"));

    let mut types = vec![
        scalar("ID"),
        scalar("String"),
        scalar("Int"),
        scalar("Float"),
        scalar("Boolean"),
        object(
            "User",
            Some("A user record from the upstream source."),
            vec![
                field("id", id()),
                field("name", string_nn()),
                field("username", string_nn()),
                field("email", string_nn()),
                field("company", named("Company")),
            ],
        ),
        object(
            "Company",
            None,
            vec![field("name", string()), field("catchPhrase", string())],
        ),
        object(
            "Post",
            Some("A post from the upstream source."),
            vec![
                field("id", id()),
                field("title", string_nn()),
                field("body", string_nn()),
                field("user", named("User")).describe("Author, loaded in batches."),
            ],
        ),
        object(
            "HealthCheck",
            None,
            vec![
                field("status", string_nn()),
                field("timestamp", string_nn()),
                field("environment", string_nn()),
            ],
        ),
        object(
            "AuthPayload",
            None,
            vec![
                field("token", string_nn()),
                field("user", non_null(named("AuthUser"))),
            ],
        ),
        object(
            "AuthUser",
            None,
            vec![
                field("id", id()),
                field("username", string_nn()),
                field("role", string_nn()),
                field("name", string_nn()),
            ],
        ),
        object(
            "QueryLog",
            None,
            vec![
                field("id", int_nn()),
                field("timestamp", string_nn()),
                field("userId", string_nn()),
                field("username", string_nn()),
                field("role", string_nn()),
                field("query", string_nn()),
                field("operationName", string()),
                field("duration", int_nn()),
                field("success", bool_nn()),
                field("error", string()),
            ],
        ),
        object(
            "UserStats",
            None,
            vec![
                field("username", string_nn()),
                field("total", int_nn()),
                field("success", int_nn()),
                field("failed", int_nn()),
            ],
        ),
        object(
            "SystemUser",
            None,
            vec![
                field("id", id()),
                field("username", string_nn()),
                field("role", string_nn()),
                field("name", string_nn()),
                field("createdAt", string_nn()),
            ],
        ),
        object(
            QUERY_TYPE,
            None,
            vec![
                field("posts", list(named("Post"))),
                field("users", list(named("User"))),
                field("health", named("HealthCheck")),
                field("me", named("AuthUser")).describe("Requires a valid bearer token."),
                field("queryLogs", list(named("QueryLog")))
                    .arg("userId", string(), None)
                    .arg("limit", named("Int"), Some(Value::from(100)))
                    .describe("Admins may filter by any user; others see their own logs."),
                field("allUsers", list(named("SystemUser"))).describe("Admin only."),
                field("userStats", list(named("UserStats"))).describe("Admin only."),
            ],
        ),
        object(
            MUTATION_TYPE,
            None,
            vec![
                field("login", non_null(named("AuthPayload")))
                    .arg("username", string_nn(), None)
                    .arg("password", string_nn(), None),
                field("register", non_null(named("AuthPayload")))
                    .arg("username", string_nn(), None)
                    .arg("password", string_nn(), None)
                    .arg("name", string_nn(), None),
            ],
        ),
    ];
    types.extend(meta_types());

    Schema {
        types: types.into_iter().map(|t| (t.name, t)).collect(),
    }
}

fn meta_types() -> Vec<TypeDef> {
    let type_ref = || non_null(named("__Type"));
    vec![
        object(
            "__Schema",
            None,
            vec![
                field("description", named("String")),
                field("types", non_null(list(type_ref()))),
                field("queryType", type_ref()),
                field("mutationType", named("__Type")),
                field("subscriptionType", named("__Type")),
                field("directives", non_null(list(non_null(named("__Directive"))))),
            ],
        ),
        object(
            "__Type",
            None,
            vec![
                field("kind", non_null(named("__TypeKind"))),
                field("name", named("String")),
                field("description", named("String")),
                field("specifiedByURL", named("String")),
                field("fields", list(non_null(named("__Field")))).arg(
                    "includeDeprecated",
                    named("Boolean"),
                    Some(Value::Bool(false)),
                ),
                field("interfaces", list(type_ref())),
                field("possibleTypes", list(type_ref())),
                field("enumValues", list(non_null(named("__EnumValue")))).arg(
                    "includeDeprecated",
                    named("Boolean"),
                    Some(Value::Bool(false)),
                ),
                field("inputFields", list(non_null(named("__InputValue")))).arg(
                    "includeDeprecated",
                    named("Boolean"),
                    Some(Value::Bool(false)),
                ),
                field("ofType", named("__Type")),
            ],
        ),
        object(
            "__Field",
            None,
            vec![
                field("name", non_null(named("String"))),
                field("description", named("String")),
                field("args", non_null(list(non_null(named("__InputValue"))))).arg(
                    "includeDeprecated",
                    named("Boolean"),
                    Some(Value::Bool(false)),
                ),
                field("type", type_ref()),
                field("isDeprecated", non_null(named("Boolean"))),
                field("deprecationReason", named("String")),
            ],
        ),
        object(
            "__InputValue",
            None,
            vec![
                field("name", non_null(named("String"))),
                field("description", named("String")),
                field("type", type_ref()),
                field("defaultValue", named("String")),
                field("isDeprecated", non_null(named("Boolean"))),
                field("deprecationReason", named("String")),
            ],
        ),
        object(
            "__EnumValue",
            None,
            vec![
                field("name", non_null(named("String"))),
                field("description", named("String")),
                field("isDeprecated", non_null(named("Boolean"))),
                field("deprecationReason", named("String")),
            ],
        ),
        object(
            "__Directive",
            None,
            vec![
                field("name", non_null(named("String"))),
                field("description", named("String")),
                field("isRepeatable", non_null(named("Boolean"))),
                field("locations", non_null(list(non_null(named("String"))))),
                field("args", non_null(list(non_null(named("__InputValue"))))).arg(
                    "includeDeprecated",
                    named("Boolean"),
                    Some(Value::Bool(false)),
                ),
            ],
        ),
        TypeDef {
            name: "__TypeKind",
            kind: TypeKind::Enum,
            description: None,
            fields: Vec::new(),
            enum_values: vec![
                "SCALAR",
                "OBJECT",
                "INTERFACE",
                "UNION",
                "ENUM",
                "INPUT_OBJECT",
                "LIST",
                "NON_NULL",
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_detection_looks_through_non_null() {
        let s = schema();
        assert!(s.field("Query", "posts").unwrap().ty.is_list());
        assert!(!s.field("Post", "user").unwrap().ty.is_list());
        assert!(s.field("__Schema", "types").unwrap().ty.is_list());
        assert_eq!(s.field("Query", "posts").unwrap().ty.to_string(), "[Post]");
        assert_eq!(
            s.field("Mutation", "login").unwrap().ty.to_string(),
            "AuthPayload!"
        );
    }

    #[test]
    fn meta_fields_resolve_only_where_allowed() {
        let s = schema();
        assert!(s.field("Post", "__typename").is_some());
        assert!(s.field("Query", "__schema").is_some());
        assert!(s.field("Post", "__schema").is_none());
        assert!(s.field("Post", "nope").is_none());
    }

    #[test]
    fn query_logs_limit_defaults_to_one_hundred() {
        let f = schema().field("Query", "queryLogs").unwrap();
        let limit = f.args.iter().find(|a| a.name == "limit").unwrap();
        assert_eq!(limit.default, Some(Value::from(100)));
    }
}
