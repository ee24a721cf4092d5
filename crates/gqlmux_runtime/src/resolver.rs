//! Resolver system.
//!
//! Field resolvers produce one value per field. Subscription resolvers produce
//! an event stream for a root subscription field.

use crate::context::Context;
use crate::error::PathSegment;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    args: FxHashMap<String, Value>,
}

impl ResolverArgs {
    /// Creates empty resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        self.args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResolverError::ArgumentParseError(name.to_string(), e.to_string()))
            })
    }

    /// Returns true if no arguments were given.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    pub field_name: String,
    pub return_type: String,
    pub parent_type: String,
    pub path: Vec<PathSegment>,
    /// Response keys of the selected sub-fields.
    pub selected_fields: Vec<String>,
}

impl ResolverInfo {
    /// Creates resolver info for a field.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            return_type: String::new(),
            parent_type: parent_type.into(),
            path: Vec::new(),
            selected_fields: Vec::new(),
        }
    }

    /// Sets the return type.
    #[must_use]
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Sets the response path.
    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// Sets the selected sub-fields.
    #[must_use]
    pub fn with_selected_fields(mut self, fields: Vec<String>) -> Self {
        self.selected_fields = fields;
        self
    }
}

/// Result type for resolvers.
pub type ResolverResult = Result<Value, ResolverError>;

/// Future type for async resolvers.
pub type ResolverFuture<'a> = BoxFuture<'a, ResolverResult>;

/// Stream of events produced by a subscription resolver.
pub type EventStream = BoxStream<'static, Result<Value, ResolverError>>;

/// Error from a resolver.
///
/// Only [`ResolverError::Public`] and the argument errors reach clients
/// verbatim; everything else is treated as unexpected and may be masked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParseError(String, String),

    /// A message written for clients.
    #[error("{0}")]
    Public(String),

    #[error("{0}")]
    Custom(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// An error whose message clients may see.
    pub fn public(message: impl Into<String>) -> Self {
        Self::Public(message.into())
    }

    /// An unexpected error, masked before it reaches clients.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Returns true when the message is safe to show to clients.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::Public(_)
                | Self::MissingArgument(_)
                | Self::ArgumentParseError(..)
                | Self::FieldNotFound(_)
        )
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

/// A boxed resolver.
pub type BoxedResolver = Box<dyn Resolver>;

/// A sync resolver function.
pub type SyncResolverFn =
    Arc<dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync>;

/// A wrapper for sync resolver functions.
pub struct FnResolver {
    func: SyncResolverFn,
}

impl FnResolver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for FnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info);
        Box::pin(async move { result })
    }
}

/// An async resolver function type.
pub type AsyncResolverFn = Arc<
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> ResolverFuture<'static> + Send + Sync,
>;

/// A wrapper for async resolver functions.
pub struct AsyncFnResolver {
    func: AsyncResolverFn,
}

impl AsyncFnResolver {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |parent, args, ctx, info| Box::pin(f(parent, args, ctx, info))),
        }
    }
}

impl Resolver for AsyncFnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        (self.func)(parent.clone(), args.clone(), ctx.clone(), info.clone())
    }
}

/// Default resolver that reads the field from the parent object.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let field_name = &info.field_name;
        let result = match parent {
            Value::Object(map) => Ok(map
                .get(field_name)
                .or_else(|| map.get(&to_snake_case(field_name)))
                .cloned()
                .unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            _ => Err(ResolverError::FieldNotFound(field_name.clone())),
        };
        Box::pin(async move { result })
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Trait for root subscription field resolvers.
pub trait SubscriptionResolver: Send + Sync {
    /// Opens the event source. Dropping the returned stream releases it.
    fn subscribe<'a>(
        &'a self,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> BoxFuture<'a, Result<EventStream, ResolverError>>;
}

type SubscribeFn = Arc<
    dyn Fn(ResolverArgs, Context) -> BoxFuture<'static, Result<EventStream, ResolverError>>
        + Send
        + Sync,
>;

/// A wrapper for async functions that open an event stream.
pub struct FnSubscriptionResolver {
    func: SubscribeFn,
}

impl FnSubscriptionResolver {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ResolverArgs, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EventStream, ResolverError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |args, ctx| Box::pin(f(args, ctx))),
        }
    }
}

impl SubscriptionResolver for FnSubscriptionResolver {
    fn subscribe<'a>(
        &'a self,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> BoxFuture<'a, Result<EventStream, ResolverError>> {
        (self.func)(args.clone(), ctx.clone())
    }
}

/// Storage for resolvers organized by type and field.
pub struct ResolverMap {
    /// Resolvers indexed by "TypeName.fieldName".
    resolvers: FxHashMap<String, BoxedResolver>,
    /// Subscription resolvers indexed by root field name.
    subscriptions: FxHashMap<String, Box<dyn SubscriptionResolver>>,
    default_resolver: Option<BoxedResolver>,
}

impl Default for ResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMap {
    pub fn new() -> Self {
        Self {
            resolvers: FxHashMap::default(),
            subscriptions: FxHashMap::default(),
            default_resolver: Some(Box::new(DefaultResolver)),
        }
    }

    /// Registers a resolver for a specific type and field.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, Box::new(resolver));
    }

    /// Registers a sync function as a resolver.
    pub fn register_fn<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Registers an async function as a resolver.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnResolver::new(f));
    }

    /// Registers the event source of a root subscription field.
    pub fn register_subscription<R: SubscriptionResolver + 'static>(
        &mut self,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        self.subscriptions.insert(field_name.into(), Box::new(resolver));
    }

    /// Gets a resolver for a type and field, falling back to the default.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&dyn Resolver> {
        let key = format!("{type_name}.{field_name}");
        self.resolvers
            .get(&key)
            .or(self.default_resolver.as_ref())
            .map(|r| &**r)
    }

    /// Gets the event source of a root subscription field.
    pub fn subscription(&self, field_name: &str) -> Option<&dyn SubscriptionResolver> {
        self.subscriptions.get(field_name).map(|r| &**r)
    }

    /// Sets the resolver used for fields without one.
    pub fn set_default<R: Resolver + 'static>(&mut self, resolver: R) {
        self.default_resolver = Some(Box::new(resolver));
    }

    /// Removes the default resolver.
    pub fn remove_default(&mut self) {
        self.default_resolver = None;
    }
}

impl Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .field("subscription_count", &self.subscriptions.len())
            .field("has_default", &self.default_resolver.is_some())
            .finish()
    }
}
