//! Builds `__schema` / `__type` values from the static schema.
//!
//! Type references are emitted as `{"__ref": "<name>"}` markers and expanded
//! by the executor only when a selection reaches into them, so recursive
//! `ofType` / `fields { type { fields ... } }` chains stay finite.

use serde_json::{Map, Value, json};

use super::schema::{
    ArgDef, FieldDef, MUTATION_TYPE, QUERY_TYPE, Schema, TypeDef, TypeKind, TypeRef,
};

const REF_KEY: &str = "__ref";

pub fn type_marker(name: &str) -> Value {
    json!({ REF_KEY: name })
}

pub fn schema_value(schema: &Schema) -> Value {
    let types = schema
        .types()
        .map(|t| type_marker(t.name))
        .collect::<Vec<_>>();

    json!({
        "description": null,
        "types": types,
        "queryType": type_marker(QUERY_TYPE),
        "mutationType": type_marker(MUTATION_TYPE),
        "subscriptionType": null,
        "directives": [
            directive("skip", "Skips this field or fragment when `if` is true."),
            directive("include", "Includes this field or fragment only when `if` is true."),
        ],
    })
}

/// Resolves `__type(name:)`; unknown names yield null.
pub fn lookup_type(schema: &Schema, name: &str) -> Value {
    match schema.get(name) {
        Some(def) => type_marker(def.name),
        None => Value::Null,
    }
}

/// Replaces a reference marker with the full `__Type` object. Other values
/// pass through untouched.
pub fn expand(schema: &Schema, value: Value) -> Value {
    let name = match value.get(REF_KEY).and_then(Value::as_str) {
        Some(name) => name,
        None => return value,
    };
    match schema.get(name) {
        Some(def) => type_value(def),
        None => Value::Null,
    }
}

fn type_value(def: &TypeDef) -> Value {
    let fields = match def.kind {
        TypeKind::Object => Value::Array(def.fields.iter().map(field_value).collect()),
        _ => Value::Null,
    };
    let interfaces = match def.kind {
        TypeKind::Object => json!([]),
        _ => Value::Null,
    };
    let enum_values = match def.kind {
        TypeKind::Enum => Value::Array(
            def.enum_values
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": null,
                        "isDeprecated": false,
                        "deprecationReason": null,
                    })
                })
                .collect(),
        ),
        _ => Value::Null,
    };

    json!({
        "kind": def.kind.as_str(),
        "name": def.name,
        "description": def.description,
        "specifiedByURL": null,
        "fields": fields,
        "interfaces": interfaces,
        "possibleTypes": null,
        "enumValues": enum_values,
        "inputFields": null,
        "ofType": null,
    })
}

fn field_value(field: &FieldDef) -> Value {
    json!({
        "name": field.name,
        "description": field.description,
        "args": field.args.iter().map(input_value).collect::<Vec<_>>(),
        "type": type_ref_value(&field.ty),
        "isDeprecated": false,
        "deprecationReason": null,
    })
}

fn input_value(arg: &ArgDef) -> Value {
    json!({
        "name": arg.name,
        "description": null,
        "type": type_ref_value(&arg.ty),
        "defaultValue": arg.default.as_ref().map(Value::to_string),
        "isDeprecated": false,
        "deprecationReason": null,
    })
}

fn type_ref_value(ty: &TypeRef) -> Value {
    let (kind, inner) = match ty {
        TypeRef::Named(name) => return type_marker(name),
        TypeRef::List(inner) => ("LIST", inner),
        TypeRef::NonNull(inner) => ("NON_NULL", inner),
    };
    let mut wrapper = Map::new();
    wrapper.insert("kind".to_string(), Value::from(kind));
    wrapper.insert("name".to_string(), Value::Null);
    wrapper.insert("description".to_string(), Value::Null);
    wrapper.insert("specifiedByURL".to_string(), Value::Null);
    wrapper.insert("fields".to_string(), Value::Null);
    wrapper.insert("interfaces".to_string(), Value::Null);
    wrapper.insert("possibleTypes".to_string(), Value::Null);
    wrapper.insert("enumValues".to_string(), Value::Null);
    wrapper.insert("inputFields".to_string(), Value::Null);
    wrapper.insert("ofType".to_string(), type_ref_value(inner));
    Value::Object(wrapper)
}

fn directive(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "isRepeatable": false,
        "locations": ["FIELD", "FRAGMENT_SPREAD", "INLINE_FRAGMENT"],
        "args": [{
            "name": "if",
            "description": null,
            "type": type_ref_value(&TypeRef::NonNull(Box::new(TypeRef::Named("Boolean")))),
            "defaultValue": null,
            "isDeprecated": false,
            "deprecationReason": null,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::schema::schema;

    #[test]
    fn markers_expand_to_full_type_objects() {
        let post = expand(schema(), lookup_type(schema(), "Post"));
        assert_eq!(post["kind"], "OBJECT");
        let names = post["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["id", "title", "body", "user"]);

        let id_type = &post["fields"][0]["type"];
        assert_eq!(id_type["kind"], "NON_NULL");
        assert_eq!(id_type["ofType"], type_marker("ID"));
    }

    #[test]
    fn unknown_type_lookup_is_null() {
        assert_eq!(lookup_type(schema(), "Nope"), Value::Null);
        assert_eq!(expand(schema(), json!({"kind": "LIST"})), json!({"kind": "LIST"}));
    }

    #[test]
    fn schema_lists_roots_and_default_values() {
        let value = schema_value(schema());
        assert_eq!(value["queryType"], type_marker("Query"));
        assert!(value["types"].as_array().unwrap().contains(&type_marker("__Type")));

        let query = expand(schema(), type_marker("Query"));
        let logs = query["fields"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["name"] == "queryLogs")
            .unwrap();
        assert_eq!(logs["args"][1]["defaultValue"], "100");

        let kind = expand(schema(), type_marker("__TypeKind"));
        assert_eq!(kind["enumValues"].as_array().unwrap().len(), 8);
    }
}
