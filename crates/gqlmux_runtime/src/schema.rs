//! Executable schema: object types, root operation types and resolvers.

use crate::context::Context;
use crate::resolver::{
    AsyncFnResolver, EventStream, FnResolver, FnSubscriptionResolver, Resolver, ResolverArgs,
    ResolverError, ResolverInfo, ResolverMap, ResolverResult, SubscriptionResolver,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// Schema metadata.
#[derive(Debug, Clone, Default)]
pub struct SchemaMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Type reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn list(inner: TypeRef) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn non_null(inner: TypeRef) -> Self {
        Self::NonNull(Box::new(inner))
    }

    /// The innermost named type.
    pub fn base_name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::List(inner) | Self::NonNull(inner) => inner.base_name(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, Self::NonNull(_))
    }

    /// Returns true for list types, looking through a non-null wrapper.
    pub fn is_list(&self) -> bool {
        match self {
            Self::List(_) => true,
            Self::NonNull(inner) => inner.is_list(),
            Self::Named(_) => false,
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::List(inner) => write!(f, "[{inner}]"),
            Self::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

/// Argument definition.
#[derive(Debug, Clone)]
pub struct ArgumentDef {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<Value>,
}

/// Field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub arguments: IndexMap<String, ArgumentDef>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            description: None,
            ty,
            arguments: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds an argument with an optional default value.
    #[must_use]
    pub fn argument(mut self, name: impl Into<String>, ty: TypeRef, default_value: Option<Value>) -> Self {
        let name = name.into();
        self.arguments.insert(
            name.clone(),
            ArgumentDef {
                name,
                ty,
                default_value,
            },
        );
        self
    }
}

/// Object type definition.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDef>,
}

impl ObjectDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: IndexMap::new(),
        }
    }

    /// Adds a field without arguments.
    #[must_use]
    pub fn field(self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.field_def(FieldDef::new(name, ty))
    }

    #[must_use]
    pub fn field_def(mut self, field: FieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }
}

/// Error returned when a schema definition is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("root type `{0}` is not defined")]
    MissingRootType(String),
    #[error("field `{type_name}.{field}` has unknown type `{ty}`")]
    UnknownFieldType {
        type_name: String,
        field: String,
        ty: String,
    },
    #[error("subscription field `{0}` has no subscription resolver")]
    MissingSubscriptionResolver(String),
}

/// A GraphQL schema.
#[derive(Debug)]
pub struct Schema {
    pub metadata: SchemaMetadata,
    query_type: String,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    types: IndexMap<String, ObjectDef>,
    scalars: FxHashSet<String>,
    resolvers: ResolverMap,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn query_type(&self) -> &str {
        &self.query_type
    }

    pub fn mutation_type(&self) -> Option<&str> {
        self.mutation_type.as_deref()
    }

    pub fn subscription_type(&self) -> Option<&str> {
        self.subscription_type.as_deref()
    }

    /// Gets an object type by name.
    pub fn object(&self, name: &str) -> Option<&ObjectDef> {
        self.types.get(name)
    }

    /// Gets a field definition.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.types.get(type_name)?.fields.get(field_name)
    }

    pub fn is_scalar(&self, name: &str) -> bool {
        self.scalars.contains(name)
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name) || self.is_scalar(name)
    }

    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    pub fn types(&self) -> impl Iterator<Item = &ObjectDef> {
        self.types.values()
    }
}

/// Schema builder.
#[derive(Debug)]
pub struct SchemaBuilder {
    metadata: SchemaMetadata,
    query_type: String,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    types: IndexMap<String, ObjectDef>,
    scalars: FxHashSet<String>,
    resolvers: ResolverMap,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            metadata: SchemaMetadata::default(),
            query_type: "Query".to_string(),
            mutation_type: None,
            subscription_type: None,
            types: IndexMap::new(),
            scalars: BUILTIN_SCALARS.iter().map(ToString::to_string).collect(),
            resolvers: ResolverMap::new(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.metadata.description = Some(desc.into());
        self
    }

    #[must_use]
    pub fn query_type(mut self, name: impl Into<String>) -> Self {
        self.query_type = name.into();
        self
    }

    #[must_use]
    pub fn mutation_type(mut self, name: impl Into<String>) -> Self {
        self.mutation_type = Some(name.into());
        self
    }

    #[must_use]
    pub fn subscription_type(mut self, name: impl Into<String>) -> Self {
        self.subscription_type = Some(name.into());
        self
    }

    /// Adds an object type.
    #[must_use]
    pub fn object(mut self, object: ObjectDef) -> Self {
        self.types.insert(object.name.clone(), object);
        self
    }

    /// Declares a custom scalar.
    #[must_use]
    pub fn scalar(mut self, name: impl Into<String>) -> Self {
        self.scalars.insert(name.into());
        self
    }

    #[must_use]
    pub fn resolver<R: Resolver + 'static>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) -> Self {
        self.resolvers.register(type_name, field_name, resolver);
        self
    }

    /// Registers a sync function as a resolver.
    #[must_use]
    pub fn resolver_fn<F>(self, type_name: impl Into<String>, field_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.resolver(type_name, field_name, FnResolver::new(f))
    }

    /// Registers an async function as a resolver.
    #[must_use]
    pub fn resolver_async<F, Fut>(
        self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.resolver(type_name, field_name, AsyncFnResolver::new(f))
    }

    #[must_use]
    pub fn subscription<R: SubscriptionResolver + 'static>(
        mut self,
        field_name: impl Into<String>,
        resolver: R,
    ) -> Self {
        self.resolvers.register_subscription(field_name, resolver);
        self
    }

    /// Registers an async function that opens the event stream of a
    /// subscription field.
    #[must_use]
    pub fn subscription_fn<F, Fut>(self, field_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ResolverArgs, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EventStream, ResolverError>> + Send + 'static,
    {
        self.subscription(field_name, FnSubscriptionResolver::new(f))
    }

    /// Builds the schema, checking root types, field types and subscription
    /// resolvers.
    pub fn build(self) -> Result<Schema, SchemaError> {
        let roots = std::iter::once(&self.query_type)
            .chain(self.mutation_type.as_ref())
            .chain(self.subscription_type.as_ref());
        for root in roots {
            if !self.types.contains_key(root) {
                return Err(SchemaError::MissingRootType(root.clone()));
            }
        }

        for object in self.types.values() {
            for field in object.fields.values() {
                let base = field.ty.base_name();
                if !self.types.contains_key(base) && !self.scalars.contains(base) {
                    return Err(SchemaError::UnknownFieldType {
                        type_name: object.name.clone(),
                        field: field.name.clone(),
                        ty: field.ty.to_string(),
                    });
                }
            }
        }

        if let Some(subscription) = self.subscription_type.as_ref().and_then(|s| self.types.get(s)) {
            for field in subscription.fields.keys() {
                if self.resolvers.subscription(field).is_none() {
                    return Err(SchemaError::MissingSubscriptionResolver(field.clone()));
                }
            }
        }

        Ok(Schema {
            metadata: self.metadata,
            query_type: self.query_type,
            mutation_type: self.mutation_type,
            subscription_type: self.subscription_type,
            types: self.types,
            scalars: self.scalars,
            resolvers: self.resolvers,
        })
    }
}

/// Error returned by a [`SchemaProvider`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SchemaLoadError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SchemaLoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl From<SchemaError> for SchemaLoadError {
    fn from(error: SchemaError) -> Self {
        Self::new("schema definition is invalid").with_source(error)
    }
}

/// Supplies the executable schema for each request.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<Schema>, SchemaLoadError>;
}

/// A provider that always returns the same schema.
#[derive(Debug, Clone)]
pub struct StaticSchema {
    schema: Arc<Schema>,
}

impl StaticSchema {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }
}

impl From<Arc<Schema>> for StaticSchema {
    fn from(schema: Arc<Schema>) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl SchemaProvider for StaticSchema {
    async fn load(&self) -> Result<Arc<Schema>, SchemaLoadError> {
        Ok(Arc::clone(&self.schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn user_schema() -> SchemaBuilder {
        SchemaBuilder::new()
            .name("Users")
            .object(
                ObjectDef::new("Query")
                    .field("user", TypeRef::named("User"))
                    .field("users", TypeRef::non_null(TypeRef::list(TypeRef::named("User")))),
            )
            .object(
                ObjectDef::new("User")
                    .field("id", TypeRef::non_null(TypeRef::named("ID")))
                    .field("name", TypeRef::named("String")),
            )
    }

    #[test]
    fn test_schema_builder() {
        let schema = user_schema().build().unwrap();

        assert_eq!(schema.metadata.name.as_deref(), Some("Users"));
        assert_eq!(schema.query_type(), "Query");
        assert!(schema.mutation_type().is_none());
        assert_eq!(schema.field("User", "id").unwrap().ty.to_string(), "ID!");
        assert!(schema.field("Query", "users").unwrap().ty.is_list());
        assert!(schema.is_scalar("String"));
        assert!(schema.has_type("User"));
    }

    #[test]
    fn test_missing_root_type() {
        let err = user_schema().mutation_type("Mutation").build().unwrap_err();
        assert_eq!(err, SchemaError::MissingRootType("Mutation".into()));
    }

    #[test]
    fn test_unknown_field_type() {
        let err = SchemaBuilder::new()
            .object(ObjectDef::new("Query").field("when", TypeRef::named("DateTime")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownFieldType { .. }));

        let ok = SchemaBuilder::new()
            .scalar("DateTime")
            .object(ObjectDef::new("Query").field("when", TypeRef::named("DateTime")))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_subscription_requires_resolver() {
        let builder = user_schema()
            .subscription_type("Subscription")
            .object(ObjectDef::new("Subscription").field("tick", TypeRef::named("Int")));
        assert_eq!(
            builder.build().unwrap_err(),
            SchemaError::MissingSubscriptionResolver("tick".into())
        );
    }

    #[tokio::test]
    async fn test_static_provider() {
        let schema = user_schema()
            .subscription_type("Subscription")
            .object(ObjectDef::new("Subscription").field("tick", TypeRef::named("Int")))
            .subscription_fn("tick", |_args, _ctx| async move {
                Ok(futures_util::stream::empty().boxed())
            })
            .build()
            .unwrap();

        let provider = StaticSchema::new(schema);
        let first = provider.load().await.unwrap();
        let second = provider.load().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
