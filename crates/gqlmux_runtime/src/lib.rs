//! Execution runtime for gqlmux.
//!
//! - `schema`: executable schema, builder and [`SchemaProvider`]
//! - `resolver`: field and subscription resolvers
//! - `validation`: document validation and operation selection
//! - `executor`: query, mutation and subscription execution
//! - `streaming`: incremental payloads and cancellable subscriptions

pub mod context;
pub mod error;
pub mod executor;
pub mod resolver;
pub mod schema;
pub mod streaming;
pub mod validation;

pub use context::Context;
pub use error::{ErrorOrigin, FieldError, PathSegment};
pub use executor::{value_to_json, Execution, ExecutionArgs, Executor, ExecutorConfig, Response};
pub use resolver::{
    AsyncFnResolver, DefaultResolver, EventStream, FnResolver, FnSubscriptionResolver, Resolver,
    ResolverArgs, ResolverError, ResolverInfo, ResolverMap, ResolverResult, SubscriptionResolver,
};
pub use schema::{
    ArgumentDef, FieldDef, ObjectDef, Schema, SchemaBuilder, SchemaError, SchemaLoadError,
    SchemaMetadata, SchemaProvider, StaticSchema, TypeRef,
};
pub use streaming::{IncrementalItem, IncrementalPayload, Subscription, SubscriptionHandle};
pub use validation::{select_operation, syntax_error, validate};
