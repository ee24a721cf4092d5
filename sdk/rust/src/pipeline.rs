//! The execution pipeline.
//!
//! A [`Pipeline`] is built once from [`PipelineOptions`] and shared by every
//! request. Per request it hands out [`PipelinePrimitives`]: `parse`,
//! `validate`, `context_factory`, `execute` and `subscribe`, all of which run
//! the configured plugins.
//!
//! Plugin order matters. Context and validation hooks run in list order;
//! error hooks run in reverse. The masking plugin always sits first in the
//! list, so it is the last to touch outgoing errors.

use crate::context::RequestContext;
use crate::error::{SdkError, SdkResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use gqlmux_runtime::{
    select_operation, syntax_error, validate, Context, ErrorOrigin, Execution, ExecutionArgs,
    Executor, ExecutorConfig, FieldError, Response, Schema,
};
use gqlmux_syntax::{Document, OperationType, Selection, SelectionSet, MAX_NESTING};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, field, info_span, Instrument, Span};

/// Default message of masked errors.
pub const DEFAULT_MASKED_MESSAGE: &str = "Unexpected error.";

/// What the pipeline knows about the operation being executed.
#[derive(Debug, Clone, Copy)]
pub struct OperationInfo<'a> {
    pub kind: OperationType,
    pub name: Option<&'a str>,
    pub document: &'a Document,
}

/// A pipeline extension. Every hook has a no-op default.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Returns fields merged into the execution context. A failure aborts the
    /// request.
    async fn on_context(&self, _context: &Context) -> SdkResult<Map<String, Value>> {
        Ok(Map::new())
    }

    /// Returns additional validation errors for the document.
    fn on_validate(&self, _schema: &Schema, _document: &Document) -> Vec<FieldError> {
        Vec::new()
    }

    /// Returns a span that execution of the operation is instrumented with.
    fn on_execute(&self, _operation: &OperationInfo<'_>) -> Option<Span> {
        None
    }

    /// Rewrites outgoing errors.
    fn on_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
        errors
    }
}

/// Error masking settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskErrors {
    /// Replacement message for unexpected errors.
    pub message: String,
    /// Keeps the original message under `extensions.originalError`.
    pub debug: bool,
}

impl Default for MaskErrors {
    fn default() -> Self {
        Self {
            message: DEFAULT_MASKED_MESSAGE.to_string(),
            debug: false,
        }
    }
}

impl MaskErrors {
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Maximum selection depth.
///
/// `ignore` entries are exact field names, or regular expressions written as
/// `/pattern/`. Ignored fields and everything below them do not count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthLimit {
    pub max_depth: usize,
    pub ignore: Vec<String>,
}

impl DepthLimit {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            ignore: Vec::new(),
        }
    }

    #[must_use]
    pub fn ignore(mut self, entry: impl Into<String>) -> Self {
        self.ignore.push(entry.into());
        self
    }

    /// Checks a document without a schema. Fails only on an invalid
    /// configuration.
    pub fn check(&self, document: &Document) -> SdkResult<Vec<FieldError>> {
        Ok(DepthLimitPlugin::new(self.clone())?.check(document))
    }
}

/// Computes extra context fields from the context built so far.
pub type ContextExtender =
    Arc<dyn Fn(Context) -> BoxFuture<'static, SdkResult<Map<String, Value>>> + Send + Sync>;

/// Tracing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    pub service_name: String,
    /// Records the full document text on the execution span.
    pub include_document: bool,
}

impl TelemetryOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            include_document: false,
        }
    }

    #[must_use]
    pub fn include_document(mut self, include: bool) -> Self {
        self.include_document = include;
        self
    }
}

/// Pipeline configuration.
#[derive(Clone)]
pub struct PipelineOptions {
    pub mask_errors: Option<MaskErrors>,
    pub depth_limit: Option<DepthLimit>,
    pub context_extender: Option<ContextExtender>,
    pub telemetry: Option<TelemetryOptions>,
    pub extra_plugins: Vec<Arc<dyn Plugin>>,
    /// When false, `@defer` and `@stream` execute inline.
    pub incremental_delivery: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<&str> = self.extra_plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("PipelineOptions")
            .field("mask_errors", &self.mask_errors)
            .field("depth_limit", &self.depth_limit)
            .field("context_extender", &self.context_extender.is_some())
            .field("telemetry", &self.telemetry)
            .field("extra_plugins", &plugins)
            .field("incremental_delivery", &self.incremental_delivery)
            .finish()
    }
}

impl PipelineOptions {
    /// Masking on with the default message; everything else off.
    pub fn new() -> Self {
        Self {
            mask_errors: Some(MaskErrors::default()),
            depth_limit: None,
            context_extender: None,
            telemetry: None,
            extra_plugins: Vec::new(),
            incremental_delivery: true,
        }
    }

    #[must_use]
    pub fn mask_errors(mut self, mask: MaskErrors) -> Self {
        self.mask_errors = Some(mask);
        self
    }

    #[must_use]
    pub fn no_mask_errors(mut self) -> Self {
        self.mask_errors = None;
        self
    }

    #[must_use]
    pub fn depth_limit(mut self, limit: DepthLimit) -> Self {
        self.depth_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn context_extender<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<Map<String, Value>>> + Send + 'static,
    {
        self.context_extender = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: TelemetryOptions) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.extra_plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn incremental_delivery(mut self, enabled: bool) -> Self {
        self.incremental_delivery = enabled;
        self
    }
}

struct PipelineInner {
    plugins: Vec<Arc<dyn Plugin>>,
    executor: Executor,
}

impl PipelineInner {
    fn process_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
        self.plugins
            .iter()
            .rev()
            .fold(errors, |errors, plugin| plugin.on_errors(errors))
    }
}

/// The long-lived pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("plugins", &self.plugin_names())
            .finish()
    }
}

impl Pipeline {
    /// Validates the options and assembles the plugin list.
    pub fn build(options: PipelineOptions) -> SdkResult<Self> {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        if let Some(mask) = options.mask_errors {
            plugins.push(Arc::new(MaskingPlugin::new(mask)));
        }
        if let Some(limit) = options.depth_limit {
            plugins.push(Arc::new(DepthLimitPlugin::new(limit)?));
        }
        if let Some(extender) = options.context_extender {
            plugins.push(Arc::new(ContextExtenderPlugin { extender }));
        }
        if let Some(telemetry) = options.telemetry {
            plugins.push(Arc::new(TelemetryPlugin { options: telemetry }));
        }
        plugins.extend(options.extra_plugins);

        let executor = Executor::with_config(ExecutorConfig {
            incremental: options.incremental_delivery,
        });
        let pipeline = Self {
            inner: Arc::new(PipelineInner { plugins, executor }),
        };
        debug!(plugins = ?pipeline.plugin_names(), "pipeline built");
        Ok(pipeline)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.inner.plugins.iter().map(|p| p.name()).collect()
    }

    /// The operations for one request.
    pub fn primitives(&self) -> PipelinePrimitives {
        PipelinePrimitives {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The per-request view of a [`Pipeline`].
#[derive(Clone)]
pub struct PipelinePrimitives {
    inner: Arc<PipelineInner>,
}

impl PipelinePrimitives {
    /// Parses a document. Errors are already processed by the error hooks.
    pub fn parse(&self, source: &str) -> Result<Arc<Document>, Vec<FieldError>> {
        let result = gqlmux_syntax::parse(source);
        match syntax_error(source, &result.diagnostics) {
            Some(error) => Err(self.process_errors(vec![error])),
            None => Ok(Arc::new(result.document)),
        }
    }

    /// Runs document validation followed by every plugin's validation hook.
    pub fn validate(&self, schema: &Schema, document: &Document) -> Vec<FieldError> {
        let mut errors = validate(schema, document);
        for plugin in &self.inner.plugins {
            errors.extend(plugin.on_validate(schema, document));
        }
        if errors.is_empty() {
            errors
        } else {
            self.process_errors(errors)
        }
    }

    /// Builds the execution context from the upstream request context and
    /// every plugin's context hook.
    pub async fn context_factory(&self, request: RequestContext) -> SdkResult<Context> {
        let mut context = request.into_context();
        for plugin in &self.inner.plugins {
            let fields = plugin.on_context(&context).await?;
            context.extend(fields);
        }
        Ok(context)
    }

    /// Executes a query or mutation.
    pub async fn execute(&self, args: ExecutionArgs) -> Execution {
        let spans = self.execution_spans(&args);
        let executor = self.inner.executor.clone();
        let run = async move { executor.execute(args).await }.boxed();

        match instrument(run, spans).await {
            Execution::Single(mut response) => {
                response.map_errors(|errors| self.process_errors(errors));
                Execution::Single(response)
            }
            Execution::Incremental(stream) => {
                let inner = Arc::clone(&self.inner);
                Execution::Incremental(
                    stream
                        .map(move |mut payload| {
                            payload.map_errors(|errors| inner.process_errors(errors));
                            payload
                        })
                        .boxed(),
                )
            }
        }
    }

    /// Starts a subscription. Errors of every event are processed by the
    /// error hooks.
    pub async fn subscribe(
        &self,
        args: ExecutionArgs,
    ) -> Result<futures_util::stream::BoxStream<'static, Response>, Response> {
        let spans = self.execution_spans(&args);
        let executor = self.inner.executor.clone();
        let run = async move { executor.subscribe(args).await }.boxed();

        match instrument(run, spans).await {
            Ok(stream) => {
                let inner = Arc::clone(&self.inner);
                Ok(stream
                    .map(move |mut response| {
                        response.map_errors(|errors| inner.process_errors(errors));
                        response
                    })
                    .boxed())
            }
            Err(mut response) => {
                response.map_errors(|errors| self.process_errors(errors));
                Err(response)
            }
        }
    }

    /// Runs every error hook, last plugin first.
    pub fn process_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
        self.inner.process_errors(errors)
    }

    fn execution_spans(&self, args: &ExecutionArgs) -> Vec<Span> {
        let Ok(operation) = select_operation(&args.document, args.operation_name.as_deref())
        else {
            return Vec::new();
        };
        let info = OperationInfo {
            kind: operation.operation,
            name: operation.name.as_ref().map(|n| n.as_str()),
            document: &args.document,
        };
        self.inner
            .plugins
            .iter()
            .filter_map(|plugin| plugin.on_execute(&info))
            .collect()
    }
}

async fn instrument<T>(future: BoxFuture<'static, T>, spans: Vec<Span>) -> T {
    let mut future = future;
    for span in spans.into_iter().rev() {
        future = future.instrument(span).boxed();
    }
    future.await
}

/// Replaces the message of unexpected errors.
struct MaskingPlugin {
    options: MaskErrors,
}

impl MaskingPlugin {
    fn new(options: MaskErrors) -> Self {
        Self { options }
    }

    fn mask(&self, error: FieldError) -> FieldError {
        if error.is_client_safe() {
            return error;
        }
        let mut masked = FieldError::new(self.options.message.clone());
        masked.locations = error.locations;
        masked.path = error.path;
        masked.origin = ErrorOrigin::Public;
        if self.options.debug {
            let mut original = Map::new();
            original.insert("message".into(), Value::String(error.message));
            if let Some(extensions) = error.extensions {
                original.insert("extensions".into(), Value::Object(extensions));
            }
            masked = masked.with_extension("originalError", Value::Object(original));
        }
        masked
    }
}

#[async_trait]
impl Plugin for MaskingPlugin {
    fn name(&self) -> &str {
        "mask-errors"
    }

    fn on_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
        errors.into_iter().map(|e| self.mask(e)).collect()
    }
}

enum IgnoreRule {
    Exact(String),
    Pattern(Regex),
}

impl IgnoreRule {
    fn parse(entry: &str) -> SdkResult<Self> {
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) => Regex::new(pattern).map(Self::Pattern).map_err(|e| {
                SdkError::configuration(format!("Invalid depth limit ignore pattern {entry}: {e}"))
            }),
            None => Ok(Self::Exact(entry.to_string())),
        }
    }

    fn matches(&self, field: &str) -> bool {
        match self {
            Self::Exact(name) => name == field,
            Self::Pattern(regex) => regex.is_match(field),
        }
    }
}

/// Rejects operations nested deeper than the limit.
struct DepthLimitPlugin {
    max_depth: usize,
    ignore: Vec<IgnoreRule>,
}

impl DepthLimitPlugin {
    fn new(limit: DepthLimit) -> SdkResult<Self> {
        if limit.max_depth == 0 {
            return Err(SdkError::configuration("Depth limit must be at least 1."));
        }
        let ignore = limit
            .ignore
            .iter()
            .map(|entry| IgnoreRule::parse(entry))
            .collect::<SdkResult<Vec<_>>>()?;
        Ok(Self {
            max_depth: limit.max_depth,
            ignore,
        })
    }

    fn is_ignored(&self, field: &str) -> bool {
        self.ignore.iter().any(|rule| rule.matches(field))
    }

    /// Depth below `set`, each fragment expanded once. The walk gives up
    /// past twice [`MAX_NESTING`] levels and reports the limit as exceeded.
    fn depth<'d>(
        &self,
        document: &'d Document,
        set: &'d SelectionSet,
        level: usize,
        memo: &mut HashMap<&'d str, usize>,
        path: &mut Vec<&'d str>,
    ) -> usize {
        if level >= 2 * MAX_NESTING {
            return self.max_depth + 1;
        }
        let mut max = 0;
        for selection in &set.selections {
            let depth = match selection {
                Selection::Field(field) => {
                    if self.is_ignored(field.name.as_str()) {
                        0
                    } else {
                        1 + field.selection_set.as_ref().map_or(0, |inner| {
                            self.depth(document, inner, level + 1, memo, path)
                        })
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.depth(document, &fragment.selection_set, level + 1, memo, path)
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    if path.contains(&name) {
                        0
                    } else if let Some(depth) = memo.get(name) {
                        *depth
                    } else if let Some(fragment) = document.fragment(name) {
                        path.push(name);
                        let depth =
                            self.depth(document, &fragment.selection_set, level + 1, memo, path);
                        path.pop();
                        memo.insert(name, depth);
                        depth
                    } else {
                        0
                    }
                }
            };
            max = max.max(depth);
        }
        max
    }
}

#[async_trait]
impl Plugin for DepthLimitPlugin {
    fn name(&self) -> &str {
        "depth-limit"
    }

    fn on_validate(&self, _schema: &Schema, document: &Document) -> Vec<FieldError> {
        self.check(document)
    }
}

impl DepthLimitPlugin {
    fn check(&self, document: &Document) -> Vec<FieldError> {
        document
            .operations()
            .filter_map(|operation| {
                let depth = self.depth(
                    document,
                    &operation.selection_set,
                    0,
                    &mut HashMap::new(),
                    &mut Vec::new(),
                );
                (depth > self.max_depth).then(|| {
                    FieldError::request(format!(
                        "Syntax Error: Query depth limit of {} exceeded, found {depth}.",
                        self.max_depth
                    ))
                    .with_location(document.location(operation.span))
                    .with_code("GRAPHQL_VALIDATION_FAILED")
                })
            })
            .collect()
    }
}

struct ContextExtenderPlugin {
    extender: ContextExtender,
}

#[async_trait]
impl Plugin for ContextExtenderPlugin {
    fn name(&self) -> &str {
        "context-extender"
    }

    async fn on_context(&self, context: &Context) -> SdkResult<Map<String, Value>> {
        (self.extender)(context.clone()).await
    }
}

/// Opens an execution span per operation and logs unexpected errors before
/// they are masked.
struct TelemetryPlugin {
    options: TelemetryOptions,
}

#[async_trait]
impl Plugin for TelemetryPlugin {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn on_execute(&self, operation: &OperationInfo<'_>) -> Option<Span> {
        let span = info_span!(
            "graphql.execute",
            service.name = %self.options.service_name,
            graphql.operation.kind = %operation.kind,
            graphql.operation.name = operation.name.unwrap_or_default(),
            graphql.document = field::Empty,
        );
        if self.options.include_document {
            span.record("graphql.document", operation.document.source.as_ref());
        }
        Some(span)
    }

    fn on_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
        for e in errors.iter().filter(|e| !e.is_client_safe()) {
            error!(
                service = %self.options.service_name,
                path = ?e.path,
                message = %e.message,
                "unexpected error"
            );
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlmux_runtime::{ObjectDef, ResolverError, SchemaBuilder, TypeRef};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new()
                .object(
                    ObjectDef::new("Query")
                        .field("version", TypeRef::named("String"))
                        .field("fail", TypeRef::named("String"))
                        .field("viewer", TypeRef::named("User")),
                )
                .object(
                    ObjectDef::new("User")
                        .field("name", TypeRef::named("String"))
                        .field("friend", TypeRef::named("User")),
                )
                .resolver_fn("Query", "version", |_, _, _, _| Ok(Value::String("1.0".into())))
                .resolver_fn("Query", "fail", |_, _, _, _| {
                    Err(ResolverError::custom("connection to 10.0.0.3 refused"))
                })
                .resolver_fn("Query", "viewer", |_, _, _, _| {
                    Ok(json!({"name": "Ada", "friend": {"name": "Bob", "friend": null}}))
                })
                .build()
                .unwrap(),
        )
    }

    fn args(schema: &Arc<Schema>, primitives: &PipelinePrimitives, query: &str) -> ExecutionArgs {
        let document = primitives.parse(query).unwrap();
        ExecutionArgs::new(Arc::clone(schema), document)
    }

    fn single(execution: Execution) -> Response {
        match execution {
            Execution::Single(response) => response,
            other => panic!("expected a single response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_masks_unexpected_errors() {
        let schema = schema();
        let primitives = Pipeline::build(PipelineOptions::new()).unwrap().primitives();
        let response = single(primitives.execute(args(&schema, &primitives, "{ fail }")).await);

        let errors = response.errors.unwrap();
        assert_eq!(errors[0].message, DEFAULT_MASKED_MESSAGE);
        assert!(errors[0].extensions.is_none());
        let body = serde_json::to_string(&response.data).unwrap();
        assert!(!body.contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_mask_debug_keeps_original() {
        let schema = schema();
        let options = PipelineOptions::new().mask_errors(MaskErrors::default().debug(true));
        let primitives = Pipeline::build(options).unwrap().primitives();
        let response = single(primitives.execute(args(&schema, &primitives, "{ fail }")).await);

        let error = &response.errors.unwrap()[0];
        assert_eq!(error.message, DEFAULT_MASKED_MESSAGE);
        assert_eq!(
            error.extensions.as_ref().unwrap()["originalError"]["message"],
            json!("connection to 10.0.0.3 refused")
        );
    }

    #[tokio::test]
    async fn test_unmasked_when_disabled() {
        let schema = schema();
        let primitives = Pipeline::build(PipelineOptions::new().no_mask_errors())
            .unwrap()
            .primitives();
        let response = single(primitives.execute(args(&schema, &primitives, "{ fail }")).await);
        assert_eq!(
            response.errors.unwrap()[0].message,
            "connection to 10.0.0.3 refused"
        );
    }

    #[test]
    fn test_syntax_errors_are_not_masked() {
        let primitives = Pipeline::build(PipelineOptions::new()).unwrap().primitives();
        let errors = primitives.parse("{ version").unwrap_err();
        assert!(errors[0].message.starts_with("Syntax Error:"));
    }

    #[test]
    fn test_depth_limit() {
        let schema = schema();
        let options = PipelineOptions::new().depth_limit(DepthLimit::new(2));
        let primitives = Pipeline::build(options).unwrap().primitives();

        let shallow = primitives.parse("{ viewer { name } }").unwrap();
        assert!(primitives.validate(&schema, &shallow).is_empty());

        let deep = primitives
            .parse("{ viewer { friend { name } } }")
            .unwrap();
        let errors = primitives.validate(&schema, &deep);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Syntax Error: Query depth limit of 2 exceeded, found 3."
        );
    }

    #[test]
    fn test_depth_limit_ignore_and_fragments() {
        let schema = schema();
        let options = PipelineOptions::new().depth_limit(DepthLimit::new(2).ignore("/^fri/"));
        let primitives = Pipeline::build(options).unwrap().primitives();

        let document = primitives
            .parse("{ viewer { ...F } } fragment F on User { friend { friend { name } } }")
            .unwrap();
        assert!(primitives.validate(&schema, &document).is_empty());

        let strict = Pipeline::build(PipelineOptions::new().depth_limit(DepthLimit::new(2)))
            .unwrap()
            .primitives();
        assert_eq!(strict.validate(&schema, &document).len(), 1);
    }

    #[test]
    fn test_depth_check_without_schema() {
        let document = gqlmux_syntax::parse("query Deep { a { b { c } } }").document;
        let errors = DepthLimit::new(2).check(&document).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(DepthLimit::new(3).check(&document).unwrap().is_empty());
        assert!(DepthLimit::new(0).check(&document).is_err());
    }

    #[test]
    fn test_depth_expands_each_fragment_once() {
        let mut source = String::from("{ ...F0 }");
        for n in 0..60 {
            source.push_str(&format!(
                "\nfragment F{n} on User {{ a {{ ...F{next} }} b {{ ...F{next} }} c {{ ...F{next} }} }}",
                next = n + 1
            ));
        }
        source.push_str("\nfragment F60 on User { name }");
        let document = gqlmux_syntax::parse(&source).document;

        assert!(DepthLimit::new(61).check(&document).unwrap().is_empty());
        let errors = DepthLimit::new(60).check(&document).unwrap();
        assert_eq!(
            errors[0].message,
            "Syntax Error: Query depth limit of 60 exceeded, found 61."
        );
    }

    #[test]
    fn test_invalid_configuration() {
        let bad_regex = PipelineOptions::new().depth_limit(DepthLimit::new(3).ignore("/(/"));
        let err = Pipeline::build(bad_regex).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConfigurationError);

        let zero = PipelineOptions::new().depth_limit(DepthLimit::new(0));
        assert!(Pipeline::build(zero).is_err());
    }

    #[tokio::test]
    async fn test_context_extender() {
        let options = PipelineOptions::new().context_extender(|ctx| async move {
            let mut extra = Map::new();
            let tenant = ctx.value("config").and_then(|c| c.get("tenant")).cloned();
            extra.insert("tenant".into(), tenant.unwrap_or(Value::Null));
            Ok(extra)
        });
        let primitives = Pipeline::build(options).unwrap().primitives();
        let request = RequestContext::new().with_config(json!({"tenant": "acme"}));

        let context = primitives.context_factory(request).await.unwrap();
        assert_eq!(context.value("tenant"), Some(&json!("acme")));
        assert_eq!(context.value("config"), Some(&json!({"tenant": "acme"})));
    }

    #[tokio::test]
    async fn test_context_failure_propagates() {
        let options = PipelineOptions::new()
            .context_extender(|_| async { Err(SdkError::internal("token store offline")) });
        let primitives = Pipeline::build(options).unwrap().primitives();

        let err = primitives
            .context_factory(RequestContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.message, "token store offline");
        let masked = primitives.process_errors(vec![err.to_field_error()]);
        assert_eq!(masked[0].message, DEFAULT_MASKED_MESSAGE);
    }

    struct Tag(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Plugin for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn on_context(&self, _context: &Context) -> SdkResult<Map<String, Value>> {
            self.1.lock().unwrap().push(self.0);
            Ok(Map::new())
        }

        fn on_errors(&self, errors: Vec<FieldError>) -> Vec<FieldError> {
            self.1.lock().unwrap().push(self.0);
            errors
        }
    }

    #[tokio::test]
    async fn test_hook_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let options = PipelineOptions::new()
            .plugin(Arc::new(Tag("a", Arc::clone(&log))))
            .plugin(Arc::new(Tag("b", Arc::clone(&log))));
        let pipeline = Pipeline::build(options).unwrap();
        assert_eq!(pipeline.plugin_names(), vec!["mask-errors", "a", "b"]);

        let primitives = pipeline.primitives();
        primitives.context_factory(RequestContext::new()).await.unwrap();
        primitives.process_errors(vec![FieldError::new("x")]);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn test_telemetry_does_not_alter_payloads() {
        let schema = schema();
        let plain = Pipeline::build(PipelineOptions::new()).unwrap().primitives();
        let traced = Pipeline::build(
            PipelineOptions::new().telemetry(TelemetryOptions::new("test").include_document(true)),
        )
        .unwrap()
        .primitives();

        let query = "{ version fail }";
        let a = single(plain.execute(args(&schema, &plain, query)).await);
        let b = single(traced.execute(args(&schema, &traced, query)).await);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }
}
