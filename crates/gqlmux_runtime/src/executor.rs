//! Operation execution.
//!
//! The executor walks the selected operation against a [`Schema`], calling
//! resolvers and completing their values. Query fields resolve concurrently,
//! mutation fields one at a time. Fragments marked `@defer` and list items past
//! `@stream(initialCount:)` become pending work that is delivered as
//! [`IncrementalPayload`]s after the initial result.

use crate::context::Context;
use crate::error::{FieldError, PathSegment};
use crate::resolver::{ResolverError, ResolverArgs, ResolverInfo};
use crate::schema::{FieldDef, Schema, TypeRef};
use crate::streaming::{IncrementalItem, IncrementalPayload};
use crate::validation::select_operation;
use futures_util::future::{self, join_all, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use gqlmux_syntax::ast::{
    self, Directive, Document, Field, OperationDefinition, OperationType, Selection, SelectionSet,
};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deliver `@defer` and `@stream` incrementally. When false both directives
    /// are ignored and everything is returned in one response.
    pub incremental: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { incremental: true }
    }
}

/// A complete GraphQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Response {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// A response without data, as produced before execution starts.
    pub fn from_error(error: FieldError) -> Self {
        Self::from_errors(vec![error])
    }

    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self {
            data: None,
            errors: non_empty(errors),
            extensions: None,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Rewrites the error list, if any.
    pub fn map_errors<F>(&mut self, f: F)
    where
        F: FnOnce(Vec<FieldError>) -> Vec<FieldError>,
    {
        if let Some(errors) = self.errors.take() {
            self.errors = non_empty(f(errors));
        }
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Result of [`Executor::execute`].
pub enum Execution {
    /// Everything was computed up front.
    Single(Response),
    /// An initial payload followed by deferred and streamed parts.
    Incremental(BoxStream<'static, IncrementalPayload>),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(response) => f.debug_tuple("Single").field(response).finish(),
            Self::Incremental(_) => f.write_str("Incremental(..)"),
        }
    }
}

/// Inputs for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionArgs {
    pub schema: Arc<Schema>,
    pub document: Arc<Document>,
    pub operation_name: Option<String>,
    pub variables: Map<String, Value>,
    pub context: Context,
    pub root_value: Value,
}

impl ExecutionArgs {
    pub fn new(schema: Arc<Schema>, document: Arc<Document>) -> Self {
        Self {
            schema,
            document,
            operation_name: None,
            variables: Map::new(),
            context: Context::new(),
            root_value: Value::Object(Map::new()),
        }
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: Option<String>) -> Self {
        self.operation_name = name;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_root_value(mut self, root_value: Value) -> Self {
        self.root_value = root_value;
        self
    }
}

/// The operation executor.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    /// Creates an executor with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes a query or mutation.
    ///
    /// Returns [`Execution::Incremental`] only when `@defer` or `@stream`
    /// actually left work for later.
    pub async fn execute(&self, args: ExecutionArgs) -> Execution {
        let ctx = match self.prepare(args) {
            Ok(ctx) => Arc::new(ctx),
            Err(response) => return Execution::Single(response),
        };
        if ctx.operation == OperationType::Subscription {
            return Execution::Single(Response::from_error(FieldError::request(
                "Subscription operations must be executed with subscribe.",
            )));
        }

        debug!(operation = %ctx.operation, root = %ctx.root_type, "executing operation");
        let collector = Collector::default();
        let data = execute_root(&ctx, &collector).await;
        let (errors, pending) = collector.into_parts();

        if pending.is_empty() {
            return Execution::Single(Response {
                data: Some(data),
                errors: non_empty(errors),
                extensions: None,
            });
        }

        debug!(pending = pending.len(), "delivering incrementally");
        let initial = IncrementalPayload::initial(Some(data), errors, true);
        Execution::Incremental(incremental_stream(ctx, initial, pending.into()))
    }

    /// Starts a subscription.
    ///
    /// Each event of the root field's source is completed against the
    /// operation's selection and yields one [`Response`]. A source error turns
    /// into an error response and the stream continues.
    pub async fn subscribe(
        &self,
        args: ExecutionArgs,
    ) -> Result<BoxStream<'static, Response>, Response> {
        let ctx = Arc::new(self.prepare(args)?);
        if ctx.operation != OperationType::Subscription {
            return Err(Response::from_error(FieldError::request(format!(
                "Expected a subscription operation, found {}.",
                ctx.operation
            ))));
        }

        let mut fields = FieldMap::new();
        ctx.collect_fields(
            &ctx.root_type,
            &ctx.root_selection,
            &mut fields,
            &mut Vec::new(),
            &mut FxHashSet::default(),
        );
        let Some((key, nodes)) = fields.into_iter().next() else {
            return Err(Response::from_error(FieldError::request(
                "Subscription must select one top level field.",
            )));
        };
        let Some(field) = nodes.first().cloned() else {
            return Err(Response::from_error(FieldError::request(
                "Subscription must select one top level field.",
            )));
        };

        let name = field.name.value.clone();
        let path = vec![PathSegment::from(key.as_str())];
        let Some(def) = ctx.schema.field(&ctx.root_type, &name).cloned() else {
            return Err(Response::from_error(ctx.located(
                FieldError::request(format!(
                    "Cannot query field \"{name}\" on type \"{}\".",
                    ctx.root_type
                )),
                &field,
                &path,
            )));
        };
        let Some(resolver) = ctx.schema.resolvers().subscription(&name) else {
            return Err(Response::from_error(ctx.located(
                FieldError::new(format!("Subscription field \"{name}\" has no event source.")),
                &field,
                &path,
            )));
        };

        let args = ctx.field_arguments(&def, &field);
        let info = ResolverInfo::new(&name, ctx.root_type.as_str())
            .with_return_type(def.ty.to_string())
            .with_path(path.clone())
            .with_selected_fields(selected_fields(&nodes));
        let events = match resolver.subscribe(&args, &ctx.context, &info).await {
            Ok(events) => events,
            Err(error) => {
                debug!(field = %name, %error, "subscription source failed to open");
                return Err(Response::from_error(ctx.located(error.into(), &field, &path)));
            }
        };

        debug!(field = %name, "subscription started");
        let root = Arc::new(RootField {
            key,
            field,
            nodes,
            ty: def.ty,
            path,
        });
        let responses = events.then(move |event| {
            let ctx = Arc::clone(&ctx);
            let root = Arc::clone(&root);
            async move { complete_event(&ctx, &root, event).await }
        });
        Ok(responses.boxed())
    }

    fn prepare(&self, args: ExecutionArgs) -> Result<ExecutionContext, Response> {
        let ExecutionArgs {
            schema,
            document,
            operation_name,
            variables,
            context,
            root_value,
        } = args;

        let operation =
            select_operation(&document, operation_name.as_deref()).map_err(Response::from_error)?;
        let root_type = match operation.operation {
            OperationType::Query => Some(schema.query_type()),
            OperationType::Mutation => schema.mutation_type(),
            OperationType::Subscription => schema.subscription_type(),
        }
        .ok_or_else(|| {
            Response::from_error(FieldError::request(format!(
                "Schema is not configured to execute {} operation.",
                operation.operation
            )))
        })?
        .to_string();

        let variables =
            coerce_variables(&document, operation, &variables).map_err(Response::from_errors)?;
        let kind = operation.operation;
        let root_selection = operation.selection_set.clone();

        Ok(ExecutionContext {
            schema,
            document,
            operation: kind,
            root_type,
            root_selection,
            root_value,
            variables,
            context,
            incremental: self.config.incremental && kind != OperationType::Subscription,
        })
    }
}

/// Fields grouped by response key, in selection order.
type FieldMap = IndexMap<String, Vec<Field>>;

/// Fields under one `@defer`.
struct DeferredGroup {
    label: Option<String>,
    fields: FieldMap,
}

struct StreamDirective {
    label: Option<String>,
    initial_count: usize,
}

/// Work left for a subsequent payload.
enum Pending {
    Defer {
        label: Option<String>,
        path: Vec<PathSegment>,
        parent_type: String,
        parent: Value,
        fields: FieldMap,
    },
    Stream {
        label: Option<String>,
        path: Vec<PathSegment>,
        index: usize,
        parent_type: String,
        field: Field,
        nodes: Vec<Field>,
        item_ty: TypeRef,
        value: Value,
    },
}

impl Pending {
    fn path(&self) -> &[PathSegment] {
        match self {
            Self::Defer { path, .. } | Self::Stream { path, .. } => path,
        }
    }
}

/// Errors and pending work gathered while producing one payload.
#[derive(Default)]
struct Collector {
    errors: Mutex<Vec<FieldError>>,
    pending: Mutex<Vec<Pending>>,
    /// Positions that failed and were replaced by `null`.
    nulled: Mutex<Vec<Vec<PathSegment>>>,
}

impl Collector {
    async fn error(&self, error: FieldError) {
        self.errors.lock().await.push(error);
    }

    async fn push(&self, pending: Pending) {
        self.pending.lock().await.push(pending);
    }

    /// Applies nullability to a completed position, remembering it when a
    /// failure turns it into `null`.
    async fn nullable(
        &self,
        result: Result<Value, ()>,
        ty: &TypeRef,
        path: &[PathSegment],
    ) -> Result<Value, ()> {
        if result.is_err() && !ty.is_non_null() {
            self.nulled.lock().await.push(path.to_vec());
        }
        nullable(result, ty)
    }

    /// Pending work under a nulled position is dropped.
    fn into_parts(self) -> (Vec<FieldError>, Vec<Pending>) {
        let nulled = self.nulled.into_inner();
        let pending = self
            .pending
            .into_inner()
            .into_iter()
            .filter(|pending| !nulled.iter().any(|prefix| pending.path().starts_with(prefix)))
            .collect();
        (self.errors.into_inner(), pending)
    }
}

/// The field whose position is being completed, for error messages.
#[derive(Clone, Copy)]
struct FieldScope<'a> {
    parent_type: &'a str,
    field: &'a Field,
}

struct RootField {
    key: String,
    field: Field,
    nodes: Vec<Field>,
    ty: TypeRef,
    path: Vec<PathSegment>,
}

struct ExecutionContext {
    schema: Arc<Schema>,
    document: Arc<Document>,
    operation: OperationType,
    root_type: String,
    root_selection: SelectionSet,
    root_value: Value,
    variables: Map<String, Value>,
    context: Context,
    incremental: bool,
}

impl ExecutionContext {
    fn located(&self, error: FieldError, field: &Field, path: &[PathSegment]) -> FieldError {
        error
            .with_location(self.document.location(field.span))
            .with_path(path.to_vec())
    }

    fn literal(&self, value: &ast::Value) -> Value {
        value_to_json(value, &self.variables)
    }

    fn directive_if(&self, directive: &Directive, default: bool) -> bool {
        directive
            .argument("if")
            .and_then(|value| self.literal(value).as_bool())
            .unwrap_or(default)
    }

    fn should_include(&self, directives: &[Directive]) -> bool {
        directives.iter().all(|d| match d.name.as_str() {
            "skip" => !self.directive_if(d, false),
            "include" => self.directive_if(d, true),
            _ => true,
        })
    }

    /// `Some(label)` when the selection is deferred.
    fn defer_label(&self, directives: &[Directive]) -> Option<Option<String>> {
        if !self.incremental {
            return None;
        }
        let directive = directives.iter().find(|d| d.name.as_str() == "defer")?;
        if !self.directive_if(directive, true) {
            return None;
        }
        Some(self.label(directive))
    }

    fn stream_directive(&self, field: &Field) -> Option<StreamDirective> {
        if !self.incremental {
            return None;
        }
        let directive = field.directives.iter().find(|d| d.name.as_str() == "stream")?;
        if !self.directive_if(directive, true) {
            return None;
        }
        let initial_count = directive
            .argument("initialCount")
            .and_then(|value| self.literal(value).as_u64())
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        Some(StreamDirective {
            label: self.label(directive),
            initial_count,
        })
    }

    fn label(&self, directive: &Directive) -> Option<String> {
        directive
            .argument("label")
            .and_then(|value| self.literal(value).as_str().map(ToString::to_string))
    }

    /// Collects the fields of `set` that apply to `parent_type`. Deferred
    /// fragments and fields are split off into `deferred`.
    fn collect_fields(
        &self,
        parent_type: &str,
        set: &SelectionSet,
        fields: &mut FieldMap,
        deferred: &mut Vec<DeferredGroup>,
        visited: &mut FxHashSet<String>,
    ) {
        for selection in &set.selections {
            let directives = selection.directives();
            if !self.should_include(directives) {
                continue;
            }
            let defer = self.defer_label(directives);

            match selection {
                Selection::Field(field) => {
                    let key = field.response_key().to_string();
                    match defer {
                        Some(label) => {
                            let mut group = FieldMap::new();
                            group.insert(key, vec![field.clone()]);
                            deferred.push(DeferredGroup {
                                label,
                                fields: group,
                            });
                        }
                        None => fields.entry(key).or_default().push(field.clone()),
                    }
                }
                Selection::InlineFragment(inline) => {
                    if inline
                        .type_condition
                        .as_ref()
                        .is_some_and(|c| c.value != parent_type)
                    {
                        continue;
                    }
                    self.collect_fragment(
                        parent_type,
                        &inline.selection_set,
                        defer,
                        fields,
                        deferred,
                        visited,
                    );
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.document.fragment(&spread.name.value) else {
                        continue;
                    };
                    if fragment.type_condition.value != parent_type
                        || !visited.insert(spread.name.value.clone())
                    {
                        continue;
                    }
                    self.collect_fragment(
                        parent_type,
                        &fragment.selection_set,
                        defer,
                        fields,
                        deferred,
                        visited,
                    );
                }
            }
        }
    }

    fn collect_fragment(
        &self,
        parent_type: &str,
        set: &SelectionSet,
        defer: Option<Option<String>>,
        fields: &mut FieldMap,
        deferred: &mut Vec<DeferredGroup>,
        visited: &mut FxHashSet<String>,
    ) {
        match defer {
            None => self.collect_fields(parent_type, set, fields, deferred, visited),
            Some(label) => {
                let mut group = FieldMap::new();
                self.collect_fields(parent_type, set, &mut group, deferred, visited);
                if !group.is_empty() {
                    deferred.push(DeferredGroup {
                        label,
                        fields: group,
                    });
                }
            }
        }
    }

    /// Builds resolver arguments, applying argument defaults.
    fn field_arguments(&self, def: &FieldDef, field: &Field) -> ResolverArgs {
        let mut args = ResolverArgs::new();
        for argument in &field.arguments {
            if let ast::Value::Variable(variable) = &argument.value {
                if !self.variables.contains_key(&variable.value) {
                    continue;
                }
            }
            args.set(argument.name.value.clone(), self.literal(&argument.value));
        }
        for (name, argument) in &def.arguments {
            if args.get(name).is_none() {
                if let Some(default) = &argument.default_value {
                    args.set(name.clone(), default.clone());
                }
            }
        }
        args
    }
}

async fn execute_root(ctx: &ExecutionContext, collector: &Collector) -> Value {
    let mut fields = FieldMap::new();
    let mut deferred = Vec::new();
    ctx.collect_fields(
        &ctx.root_type,
        &ctx.root_selection,
        &mut fields,
        &mut deferred,
        &mut FxHashSet::default(),
    );

    let serial = ctx.operation == OperationType::Mutation;
    match execute_fields(ctx, collector, &ctx.root_type, &ctx.root_value, fields, &[], serial).await {
        Ok(map) => {
            for group in deferred {
                collector
                    .push(Pending::Defer {
                        label: group.label,
                        path: Vec::new(),
                        parent_type: ctx.root_type.clone(),
                        parent: ctx.root_value.clone(),
                        fields: group.fields,
                    })
                    .await;
            }
            Value::Object(map)
        }
        Err(()) => {
            collector.nulled.lock().await.push(Vec::new());
            Value::Null
        }
    }
}

/// Executes a grouped field set. `Err(())` means a non-null field failed and
/// the enclosing object must become null; the error is already recorded.
fn execute_fields<'a>(
    ctx: &'a ExecutionContext,
    collector: &'a Collector,
    parent_type: &'a str,
    parent: &'a Value,
    fields: FieldMap,
    path: &'a [PathSegment],
    serial: bool,
) -> BoxFuture<'a, Result<Map<String, Value>, ()>> {
    async move {
        let mut results = Map::new();
        if serial {
            for (key, nodes) in &fields {
                let value =
                    execute_field(ctx, collector, parent_type, parent, key, nodes, path).await?;
                results.insert(key.clone(), value);
            }
        } else {
            let values = join_all(fields.iter().map(|(key, nodes)| {
                execute_field(ctx, collector, parent_type, parent, key, nodes, path)
            }))
            .await;
            for ((key, _), value) in fields.iter().zip(values) {
                results.insert(key.clone(), value?);
            }
        }
        Ok(results)
    }
    .boxed()
}

fn execute_field<'a>(
    ctx: &'a ExecutionContext,
    collector: &'a Collector,
    parent_type: &'a str,
    parent: &'a Value,
    key: &'a str,
    nodes: &'a [Field],
    path: &'a [PathSegment],
) -> BoxFuture<'a, Result<Value, ()>> {
    async move {
        let Some(field) = nodes.first() else {
            return Ok(Value::Null);
        };
        let name = field.name.as_str();
        let mut field_path = path.to_vec();
        field_path.push(PathSegment::from(key));

        if name == "__typename" {
            return Ok(Value::String(parent_type.to_string()));
        }

        let Some(def) = ctx.schema.field(parent_type, name) else {
            let message = format!("Cannot query field \"{name}\" on type \"{parent_type}\".");
            collector
                .error(ctx.located(FieldError::request(message), field, &field_path))
                .await;
            return Ok(Value::Null);
        };

        let args = ctx.field_arguments(def, field);
        let info = ResolverInfo::new(name, parent_type)
            .with_return_type(def.ty.to_string())
            .with_path(field_path.clone())
            .with_selected_fields(selected_fields(nodes));
        let resolved = match ctx.schema.resolvers().get(parent_type, name) {
            Some(resolver) => resolver.resolve(parent, &args, &ctx.context, &info).await,
            None => Ok(Value::Null),
        };

        let mut value = match resolved {
            Ok(value) => value,
            Err(error) => {
                debug!(field = %format!("{parent_type}.{name}"), %error, "resolver failed");
                collector
                    .error(ctx.located(error.into(), field, &field_path))
                    .await;
                return nullable(Err(()), &def.ty);
            }
        };

        let stream = ctx.stream_directive(field).filter(|_| def.ty.is_list());
        let mut initial_len = 0;
        let mut streamed = Vec::new();
        if let (Some(directive), Value::Array(items)) = (&stream, &mut value) {
            initial_len = directive.initial_count.min(items.len());
            streamed = items.split_off(initial_len);
        }

        let scope = FieldScope { parent_type, field };
        let completed =
            complete_value(ctx, collector, scope, &def.ty, nodes, value, field_path.clone()).await;

        if completed.is_ok() {
            if let (Some(directive), Some(item_ty)) = (stream, list_item(&def.ty)) {
                for (offset, item) in streamed.into_iter().enumerate() {
                    collector
                        .push(Pending::Stream {
                            label: directive.label.clone(),
                            path: field_path.clone(),
                            index: initial_len + offset,
                            parent_type: parent_type.to_string(),
                            field: field.clone(),
                            nodes: nodes.to_vec(),
                            item_ty: item_ty.clone(),
                            value: item,
                        })
                        .await;
                }
            }
        }
        collector.nullable(completed, &def.ty, &field_path).await
    }
    .boxed()
}

/// Completes a resolved value against its declared type. `Err(())` means the
/// position could not be completed; nullability is applied by the caller.
fn complete_value<'a>(
    ctx: &'a ExecutionContext,
    collector: &'a Collector,
    scope: FieldScope<'a>,
    ty: &'a TypeRef,
    nodes: &'a [Field],
    value: Value,
    path: Vec<PathSegment>,
) -> BoxFuture<'a, Result<Value, ()>> {
    async move {
        match ty {
            TypeRef::NonNull(inner) => {
                let completed =
                    complete_value(ctx, collector, scope, inner, nodes, value, path.clone()).await?;
                if completed.is_null() {
                    let message = format!(
                        "Cannot return null for non-nullable field {}.{}.",
                        scope.parent_type, scope.field.name.value
                    );
                    collector
                        .error(ctx.located(FieldError::new(message), scope.field, &path))
                        .await;
                    return Err(());
                }
                Ok(completed)
            }
            _ if value.is_null() => Ok(Value::Null),
            TypeRef::List(item_ty) => {
                let Value::Array(items) = value else {
                    let message = format!(
                        "Expected Iterable, but did not find one for field \"{}.{}\".",
                        scope.parent_type, scope.field.name.value
                    );
                    collector
                        .error(ctx.located(FieldError::new(message), scope.field, &path))
                        .await;
                    return Err(());
                };
                let item_path = |index: usize| {
                    let mut item_path = path.clone();
                    item_path.push(PathSegment::Index(index));
                    item_path
                };
                let futures = items.into_iter().enumerate().map(|(index, item)| {
                    complete_value(ctx, collector, scope, item_ty, nodes, item, item_path(index))
                });
                let mut completed = Vec::new();
                for (index, result) in join_all(futures).await.into_iter().enumerate() {
                    completed.push(collector.nullable(result, item_ty, &item_path(index)).await?);
                }
                Ok(Value::Array(completed))
            }
            TypeRef::Named(name) => {
                if ctx.schema.object(name).is_some() {
                    return complete_object(ctx, collector, name, value, nodes, path).await;
                }
                match serialize_scalar(name, value) {
                    Ok(value) => Ok(value),
                    Err(message) => {
                        collector
                            .error(ctx.located(FieldError::new(message), scope.field, &path))
                            .await;
                        Err(())
                    }
                }
            }
        }
    }
    .boxed()
}

fn complete_object<'a>(
    ctx: &'a ExecutionContext,
    collector: &'a Collector,
    type_name: &'a str,
    value: Value,
    nodes: &'a [Field],
    path: Vec<PathSegment>,
) -> BoxFuture<'a, Result<Value, ()>> {
    async move {
        let mut fields = FieldMap::new();
        let mut deferred = Vec::new();
        let mut visited = FxHashSet::default();
        for node in nodes {
            if let Some(set) = &node.selection_set {
                ctx.collect_fields(type_name, set, &mut fields, &mut deferred, &mut visited);
            }
        }

        let map = execute_fields(ctx, collector, type_name, &value, fields, &path, false).await?;
        for group in deferred {
            collector
                .push(Pending::Defer {
                    label: group.label,
                    path: path.clone(),
                    parent_type: type_name.to_string(),
                    parent: value.clone(),
                    fields: group.fields,
                })
                .await;
        }
        Ok(Value::Object(map))
    }
    .boxed()
}

fn incremental_stream(
    ctx: Arc<ExecutionContext>,
    initial: IncrementalPayload,
    queue: VecDeque<Pending>,
) -> BoxStream<'static, IncrementalPayload> {
    let subsequent = stream::unfold((ctx, queue), |(ctx, mut queue)| async move {
        let next = queue.pop_front()?;
        let (item, more) = resolve_pending(&ctx, next).await;
        queue.extend(more);
        let payload = IncrementalPayload::subsequent(item, !queue.is_empty());
        Some((payload, (ctx, queue)))
    });
    stream::once(future::ready(initial)).chain(subsequent).boxed()
}

async fn resolve_pending(ctx: &ExecutionContext, pending: Pending) -> (IncrementalItem, Vec<Pending>) {
    let collector = Collector::default();
    match pending {
        Pending::Defer {
            label,
            path,
            parent_type,
            parent,
            fields,
        } => {
            let data = execute_fields(ctx, &collector, &parent_type, &parent, fields, &path, false)
                .await
                .ok()
                .map(Value::Object);
            if data.is_none() {
                collector.nulled.lock().await.push(path.clone());
            }
            let (errors, more) = collector.into_parts();
            let item = IncrementalItem::Defer {
                data,
                path,
                label,
                errors: non_empty(errors),
            };
            (item, more)
        }
        Pending::Stream {
            label,
            path,
            index,
            parent_type,
            field,
            nodes,
            item_ty,
            value,
        } => {
            let mut item_path = path;
            item_path.push(PathSegment::Index(index));
            let scope = FieldScope {
                parent_type: &parent_type,
                field: &field,
            };
            let completed =
                complete_value(ctx, &collector, scope, &item_ty, &nodes, value, item_path.clone())
                    .await;
            let items = collector
                .nullable(completed, &item_ty, &item_path)
                .await
                .ok()
                .map(|value| vec![value]);
            if items.is_none() {
                collector.nulled.lock().await.push(item_path.clone());
            }
            let (errors, more) = collector.into_parts();
            let item = IncrementalItem::Stream {
                items,
                path: item_path,
                label,
                errors: non_empty(errors),
            };
            (item, more)
        }
    }
}

async fn complete_event(
    ctx: &ExecutionContext,
    root: &RootField,
    event: Result<Value, ResolverError>,
) -> Response {
    let value = match event {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "subscription event failed");
            return Response::from_error(ctx.located(error.into(), &root.field, &root.path));
        }
    };

    let collector = Collector::default();
    let scope = FieldScope {
        parent_type: &ctx.root_type,
        field: &root.field,
    };
    let completed =
        complete_value(ctx, &collector, scope, &root.ty, &root.nodes, value, root.path.clone()).await;
    let data = match nullable(completed, &root.ty) {
        Ok(value) => {
            let mut map = Map::new();
            map.insert(root.key.clone(), value);
            Value::Object(map)
        }
        Err(()) => Value::Null,
    };
    let (errors, _) = collector.into_parts();
    Response {
        data: Some(data),
        errors: non_empty(errors),
        extensions: None,
    }
}

/// Turns a failed nullable position into `null`.
fn nullable(result: Result<Value, ()>, ty: &TypeRef) -> Result<Value, ()> {
    if ty.is_non_null() {
        result
    } else {
        Ok(result.unwrap_or(Value::Null))
    }
}

fn list_item(ty: &TypeRef) -> Option<&TypeRef> {
    match ty {
        TypeRef::NonNull(inner) => list_item(inner),
        TypeRef::List(item) => Some(item),
        TypeRef::Named(_) => None,
    }
}

fn selected_fields(nodes: &[Field]) -> Vec<String> {
    nodes
        .iter()
        .filter_map(|node| node.selection_set.as_ref())
        .flat_map(|set| set.selections.iter())
        .filter_map(|selection| match selection {
            Selection::Field(field) => Some(field.response_key().to_string()),
            _ => None,
        })
        .collect()
}

fn serialize_scalar(name: &str, value: Value) -> Result<Value, String> {
    match name {
        "Int" => match value.as_i64() {
            Some(n) if i32::try_from(n).is_ok() => Ok(value),
            _ => Err(format!("Int cannot represent non-integer value: {value}")),
        },
        "Float" if value.is_number() => Ok(value),
        "Float" => Err(format!("Float cannot represent non numeric value: {value}")),
        "String" => match value {
            Value::String(_) => Ok(value),
            Value::Number(_) | Value::Bool(_) => Ok(Value::String(value.to_string())),
            _ => Err(format!("String cannot represent value: {value}")),
        },
        "Boolean" if value.is_boolean() => Ok(value),
        "Boolean" => Err(format!("Boolean cannot represent a non boolean value: {value}")),
        "ID" => match value {
            Value::String(_) => Ok(value),
            Value::Number(ref n) if n.is_i64() || n.is_u64() => Ok(Value::String(n.to_string())),
            _ => Err(format!("ID cannot represent value: {value}")),
        },
        _ => Ok(value),
    }
}

fn non_empty(errors: Vec<FieldError>) -> Option<Vec<FieldError>> {
    (!errors.is_empty()).then_some(errors)
}

/// Converts a literal to JSON, substituting variables.
pub fn value_to_json(value: &ast::Value, variables: &Map<String, Value>) -> Value {
    match value {
        ast::Value::Variable(name) => variables.get(&name.value).cloned().unwrap_or(Value::Null),
        ast::Value::Int(n) => Value::from(*n),
        ast::Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        ast::Value::String(s) | ast::Value::Enum(s) => Value::String(s.clone()),
        ast::Value::Boolean(b) => Value::Bool(*b),
        ast::Value::Null => Value::Null,
        ast::Value::List(items) => Value::Array(
            items
                .iter()
                .map(|item| value_to_json(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, item)| (name.value.clone(), value_to_json(item, variables)))
                .collect(),
        ),
    }
}

fn coerce_variables(
    document: &Document,
    operation: &OperationDefinition,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, Vec<FieldError>> {
    let mut coerced = Map::new();
    let mut errors = Vec::new();

    for definition in &operation.variables {
        let name = &definition.name.value;
        let ty = &definition.ty;
        let message = match provided.get(name) {
            Some(Value::Null) if ty.is_non_null() => Some(format!(
                "Variable \"${name}\" of non-null type \"{ty}\" must not be null."
            )),
            Some(value) if accepts(ty, value) => {
                coerced.insert(name.clone(), value.clone());
                None
            }
            Some(value) => Some(format!(
                "Variable \"${name}\" got invalid value {value}; Expected type \"{}\".",
                ty.base_name()
            )),
            None => match &definition.default_value {
                Some(default) => {
                    coerced.insert(name.clone(), value_to_json(default, &Map::new()));
                    None
                }
                None if ty.is_non_null() => Some(format!(
                    "Variable \"${name}\" of required type \"{ty}\" was not provided."
                )),
                None => None,
            },
        };
        if let Some(message) = message {
            errors.push(
                FieldError::request(message).with_location(document.location(definition.span)),
            );
        }
    }

    if errors.is_empty() {
        Ok(coerced)
    } else {
        Err(errors)
    }
}

fn accepts(ty: &ast::Type, value: &Value) -> bool {
    match ty {
        ast::Type::NonNull(inner) => !value.is_null() && accepts(inner, value),
        _ if value.is_null() => true,
        ast::Type::List(inner) => match value {
            Value::Array(items) => items.iter().all(|item| accepts(inner, item)),
            other => accepts(inner, other),
        },
        ast::Type::Named(name) => match name.as_str() {
            "Int" => value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()),
            "Float" => value.is_number(),
            "String" => value.is_string(),
            "Boolean" => value.is_boolean(),
            "ID" => value.is_string() || value.is_i64() || value.is_u64(),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, ObjectDef, SchemaBuilder};
    use serde_json::json;

    fn create_test_schema() -> Arc<Schema> {
        let schema = SchemaBuilder::new()
            .mutation_type("Mutation")
            .subscription_type("Subscription")
            .object(
                ObjectDef::new("Query")
                    .field("version", TypeRef::named("String"))
                    .field_def(
                        FieldDef::new("user", TypeRef::named("User")).argument(
                            "id",
                            TypeRef::named("ID"),
                            None,
                        ),
                    )
                    .field("broken", TypeRef::named("User"))
                    .field(
                        "users",
                        TypeRef::non_null(TypeRef::list(TypeRef::non_null(TypeRef::named("User")))),
                    )
                    .field_def(
                        FieldDef::new("hello", TypeRef::named("String")).argument(
                            "name",
                            TypeRef::named("String"),
                            Some(json!("World")),
                        ),
                    )
                    .field("numbers", TypeRef::list(TypeRef::named("Int")))
                    .field("failing", TypeRef::named("String"))
                    .field("pair", TypeRef::named("Pair")),
            )
            .object(
                ObjectDef::new("Pair")
                    .field("user", TypeRef::named("User"))
                    .field("missing", TypeRef::non_null(TypeRef::named("String"))),
            )
            .object(
                ObjectDef::new("User")
                    .field("id", TypeRef::non_null(TypeRef::named("ID")))
                    .field("name", TypeRef::named("String")),
            )
            .object(
                ObjectDef::new("Mutation")
                    .field("first", TypeRef::named("Int"))
                    .field("second", TypeRef::named("Int")),
            )
            .object(ObjectDef::new("Subscription").field("tick", TypeRef::named("Int")))
            .resolver_fn("Query", "version", |_, _, _, _| Ok(json!("1")))
            .resolver_fn("Query", "user", |_, args, _, _| {
                let id = args.get("id").cloned().unwrap_or(json!("1"));
                Ok(json!({"id": id, "name": "Alice"}))
            })
            .resolver_fn("Query", "broken", |_, _, _, _| Ok(json!({"id": null, "name": "Ghost"})))
            .resolver_fn("Query", "users", |_, _, _, _| {
                Ok(json!([{"id": "1", "name": "Alice"}, {"id": "2", "name": "Bob"}]))
            })
            .resolver_fn("Query", "hello", |_, args, _, _| {
                let name: String = args.require("name")?;
                Ok(json!(format!("Hello, {name}!")))
            })
            .resolver_fn("Query", "numbers", |_, _, _, _| Ok(json!([1, 2, 3])))
            .resolver_fn("Query", "pair", |_, _, _, _| {
                Ok(json!({"user": {"id": "1", "name": "Alice"}, "missing": null}))
            })
            .resolver_fn("Query", "failing", |_, _, _, _| Err(ResolverError::custom("db down")))
            .subscription_fn("tick", |_args, _ctx| async move {
                let events = vec![
                    Ok(json!(1)),
                    Err(ResolverError::public("boom")),
                    Ok(json!(3)),
                ];
                Ok(stream::iter(events).boxed())
            })
            .build()
            .unwrap();
        Arc::new(schema)
    }

    fn args(schema: &Arc<Schema>, query: &str) -> ExecutionArgs {
        let parsed = gqlmux_syntax::parse(query);
        assert!(!parsed.has_errors(), "{:?}", parsed.diagnostics);
        ExecutionArgs::new(Arc::clone(schema), Arc::new(parsed.document))
    }

    async fn execute_single(args: ExecutionArgs) -> Response {
        match Executor::new().execute(args).await {
            Execution::Single(response) => response,
            Execution::Incremental(_) => panic!("expected a single response"),
        }
    }

    async fn execute_incremental(executor: &Executor, args: ExecutionArgs) -> Vec<Value> {
        match executor.execute(args).await {
            Execution::Incremental(payloads) => payloads
                .map(|payload| serde_json::to_value(payload).unwrap())
                .collect::<Vec<_>>()
                .await,
            Execution::Single(response) => panic!("expected incremental delivery, got {response:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_simple_query() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "{ version user { id name } }")).await;

        assert!(!response.has_errors());
        assert_eq!(
            response.data,
            Some(json!({"version": "1", "user": {"id": "1", "name": "Alice"}}))
        );
    }

    #[tokio::test]
    async fn test_execute_typename() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "{ __typename user { __typename } }")).await;
        assert_eq!(
            response.data,
            Some(json!({"__typename": "Query", "user": {"__typename": "User"}}))
        );
    }

    #[tokio::test]
    async fn test_execute_with_arguments() {
        let schema = create_test_schema();
        let mut variables = Map::new();
        variables.insert("who".into(), json!("Bob"));
        let request = args(&schema, "query ($who: String) { a: hello b: hello(name: $who) }")
            .with_variables(variables);

        let response = execute_single(request).await;
        assert_eq!(
            response.data,
            Some(json!({"a": "Hello, World!", "b": "Hello, Bob!"}))
        );
    }

    #[tokio::test]
    async fn test_execute_with_error() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "{ failing version }")).await;

        assert_eq!(response.data, Some(json!({"failing": null, "version": "1"})));
        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "db down");
        assert_eq!(errors[0].path, Some(vec!["failing".into()]));
        assert!(!errors[0].is_client_safe());
    }

    #[tokio::test]
    async fn test_non_null_propagates_to_parent() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "{ broken { id name } version }")).await;

        assert_eq!(response.data, Some(json!({"broken": null, "version": "1"})));
        let errors = response.errors.unwrap();
        assert_eq!(errors[0].message, "Cannot return null for non-nullable field User.id.");
        assert_eq!(errors[0].path, Some(vec!["broken".into(), "id".into()]));
    }

    #[tokio::test]
    async fn test_execute_list_field() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "{ users { name } }")).await;
        assert_eq!(
            response.data,
            Some(json!({"users": [{"name": "Alice"}, {"name": "Bob"}]}))
        );
    }

    #[tokio::test]
    async fn test_skip_and_include() {
        let schema = create_test_schema();
        let mut variables = Map::new();
        variables.insert("on".into(), json!(false));
        let request = args(
            &schema,
            "query ($on: Boolean!) { version @include(if: $on) user @skip(if: $on) { id } }",
        )
        .with_variables(variables);

        let response = execute_single(request).await;
        assert_eq!(response.data, Some(json!({"user": {"id": "1"}})));
    }

    #[tokio::test]
    async fn test_mutations_run_serially() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&order), Arc::clone(&order));
        let schema = SchemaBuilder::new()
            .mutation_type("Mutation")
            .object(ObjectDef::new("Query").field("version", TypeRef::named("String")))
            .object(
                ObjectDef::new("Mutation")
                    .field("first", TypeRef::named("Int"))
                    .field("second", TypeRef::named("Int")),
            )
            .resolver_async("Mutation", "first", move |_, _, _, _| {
                let order = Arc::clone(&first);
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    order.lock().unwrap().push("first");
                    Ok(json!(1))
                }
            })
            .resolver_async("Mutation", "second", move |_, _, _, _| {
                let order = Arc::clone(&second);
                async move {
                    order.lock().unwrap().push("second");
                    Ok(json!(2))
                }
            })
            .build()
            .unwrap();

        let response = execute_single(args(&Arc::new(schema), "mutation { first second }")).await;
        assert_eq!(response.data, Some(json!({"first": 1, "second": 2})));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_defer_fragment() {
        let schema = create_test_schema();
        let payloads = execute_incremental(
            &Executor::new(),
            args(&schema, "{ user { id ... @defer(label: \"profile\") { name } } }"),
        )
        .await;

        assert_eq!(
            payloads,
            vec![
                json!({"data": {"user": {"id": "1"}}, "hasNext": true}),
                json!({
                    "incremental": [{"data": {"name": "Alice"}, "path": ["user"], "label": "profile"}],
                    "hasNext": false
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_defer_under_nulled_parent_is_dropped() {
        let schema = create_test_schema();
        let response = execute_single(args(
            &schema,
            "{ pair { user { id ... @defer { name } } missing } version }",
        ))
        .await;

        assert_eq!(response.data, Some(json!({"pair": null, "version": "1"})));
        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Cannot return null for non-nullable field Pair.missing."
        );
    }

    #[tokio::test]
    async fn test_defer_beside_nulled_sibling_is_kept() {
        let schema = create_test_schema();
        let payloads = execute_incremental(
            &Executor::new(),
            args(&schema, "{ pair { missing } user { id ... @defer { name } } }"),
        )
        .await;

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["data"], json!({"pair": null, "user": {"id": "1"}}));
        assert_eq!(
            payloads[1]["incremental"],
            json!([{"data": {"name": "Alice"}, "path": ["user"]}])
        );
    }

    #[tokio::test]
    async fn test_defer_if_false_is_inline() {
        let schema = create_test_schema();
        let response =
            execute_single(args(&schema, "{ user { id ... @defer(if: false) { name } } }")).await;
        assert_eq!(response.data, Some(json!({"user": {"id": "1", "name": "Alice"}})));
    }

    #[tokio::test]
    async fn test_stream_list() {
        let schema = create_test_schema();
        let payloads = execute_incremental(
            &Executor::new(),
            args(&schema, "{ numbers @stream(initialCount: 1) }"),
        )
        .await;

        assert_eq!(
            payloads,
            vec![
                json!({"data": {"numbers": [1]}, "hasNext": true}),
                json!({"incremental": [{"items": [2], "path": ["numbers", 1]}], "hasNext": true}),
                json!({"incremental": [{"items": [3], "path": ["numbers", 2]}], "hasNext": false}),
            ]
        );
    }

    #[tokio::test]
    async fn test_incremental_disabled_executes_inline() {
        let schema = create_test_schema();
        let executor = Executor::with_config(ExecutorConfig { incremental: false });
        let request = args(&schema, "{ numbers @stream(initialCount: 1) }");

        match executor.execute(request).await {
            Execution::Single(response) => {
                assert_eq!(response.data, Some(json!({"numbers": [1, 2, 3]})));
            }
            Execution::Incremental(_) => panic!("incremental delivery is disabled"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_variable() {
        let schema = create_test_schema();
        let response = execute_single(args(&schema, "query ($id: ID!) { user(id: $id) { id } }")).await;

        assert_eq!(response.data, None);
        let errors = response.errors.unwrap();
        assert_eq!(
            errors[0].message,
            "Variable \"$id\" of required type \"ID!\" was not provided."
        );
        assert!(errors[0].is_client_safe());
    }

    #[tokio::test]
    async fn test_unknown_operation_name() {
        let schema = create_test_schema();
        let request =
            args(&schema, "query A { version }").with_operation_name(Some("B".to_string()));
        let response = execute_single(request).await;
        assert_eq!(
            response.errors.unwrap()[0].message,
            "Unknown operation named \"B\"."
        );
    }

    #[tokio::test]
    async fn test_subscribe_completes_each_event() {
        let schema = create_test_schema();
        let stream = Executor::new()
            .subscribe(args(&schema, "subscription { count: tick }"))
            .await
            .unwrap();
        let responses: Vec<Response> = stream.collect().await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].data, Some(json!({"count": 1})));
        assert_eq!(responses[1].data, None);
        assert_eq!(responses[1].errors.as_ref().unwrap()[0].message, "boom");
        assert_eq!(responses[2].data, Some(json!({"count": 3})));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_queries() {
        let schema = create_test_schema();
        let error = Executor::new()
            .subscribe(args(&schema, "{ version }"))
            .await
            .err().unwrap();
        assert_eq!(
            error.errors.unwrap()[0].message,
            "Expected a subscription operation, found query."
        );
    }

    #[test]
    fn test_response_serialization() {
        let response = Response::data(json!({"ok": true})).with_extension("tracing", json!(1));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"data": {"ok": true}, "extensions": {"tracing": 1}})
        );

        let mut failed = Response::from_error(FieldError::new("boom"));
        failed.map_errors(|_| vec![FieldError::new("Unexpected error.")]);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"errors": [{"message": "Unexpected error."}]})
        );
    }
}
