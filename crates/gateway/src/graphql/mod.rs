//! The in-process GraphQL engine: static schema, document lowering,
//! resolvers and a small concurrent executor.

pub mod document;
pub mod executor;
pub mod introspection;
pub mod resolvers;
pub mod schema;

pub use document::{
    FieldNode, OperationKind, OperationPlan, PlanLimits, plan_operation, plan_operation_with,
};
pub use executor::{ExecutionOutcome, FieldError, PathSegment, execute};
pub use resolvers::{ResolverContext, Services};
pub use schema::schema;
