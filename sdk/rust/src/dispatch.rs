//! The response dispatcher.
//!
//! Drives one request through the pipeline and decides how the result
//! travels back: a single JSON response, an incremental multipart stream or a
//! live event stream.

use crate::context::RequestContext;
use crate::error::{ErrorCode, SdkError, SdkResult};
use crate::framing::{BoxBody, ExecutionResult, SingleResponse};
use crate::pipeline::{Pipeline, PipelinePrimitives};
use crate::request::{normalize, NormalizedOperation};
use bytes::Bytes;
use gqlmux_runtime::{
    select_operation, ErrorOrigin, Execution, ExecutionArgs, FieldError, Response,
    SchemaProvider, Subscription,
};
use gqlmux_syntax::OperationType;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW};
use hyper::{Method, Request, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Dispatches GraphQL requests. Cheap to clone; share one per server.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Pipeline,
    schema: Arc<dyn SchemaProvider>,
    upload_limit: Option<u64>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pipeline", &self.pipeline)
            .field("upload_limit", &self.upload_limit)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(pipeline: Pipeline, schema: Arc<dyn SchemaProvider>) -> Self {
        Self {
            pipeline,
            schema,
            upload_limit: None,
        }
    }

    /// Rejects request bodies larger than `bytes` with 413.
    #[must_use]
    pub fn with_upload_limit(mut self, bytes: u64) -> Self {
        self.upload_limit = Some(bytes);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Handles one HTTP request.
    ///
    /// Only a schema load failure is returned as `Err`; every other problem
    /// becomes an error response.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        context: RequestContext,
    ) -> SdkResult<hyper::Response<BoxBody>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let body = match self.collect(&parts.method, body).await {
            Ok(body) => body,
            Err(err) => return Ok(self.reject(&err).into_http()),
        };
        let operation = match normalize(&parts, &body) {
            Ok(operation) => operation,
            Err(err) => return Ok(self.reject(&err).into_http()),
        };

        let result = self.dispatch(&parts.method, operation, context).await?;
        debug!(mode = result.kind(), "dispatching response");
        Ok(result.into_http())
    }

    async fn collect<B>(&self, method: &Method, body: B) -> SdkResult<Bytes>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if *method == Method::GET {
            return Ok(Bytes::new());
        }
        let limit = self
            .upload_limit
            .map_or(usize::MAX, |bytes| usize::try_from(bytes).unwrap_or(usize::MAX));
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.is::<LengthLimitError>() => {
                Err(SdkError::payload_too_large(self.upload_limit.unwrap_or_default()))
            }
            Err(err) => Err(SdkError::transport(format!(
                "Failed to read request body: {err}"
            ))),
        }
    }

    /// A single error response for a failure that happened before parsing.
    fn reject(&self, err: &SdkError) -> SingleResponse {
        debug!(code = %err.code, message = %err.message, "rejecting request");
        let errors = self.pipeline.primitives().process_errors(vec![err.to_field_error()]);
        let response = SingleResponse::from_errors(err.status(), errors);
        if err.code == ErrorCode::MethodNotAllowed {
            response.with_header(ALLOW, HeaderValue::from_static("GET, POST"))
        } else {
            response
        }
    }

    /// Runs a normalized operation. `method` is the HTTP method it arrived
    /// with; mutations are refused over GET.
    pub async fn dispatch(
        &self,
        method: &Method,
        operation: NormalizedOperation,
        context: RequestContext,
    ) -> SdkResult<ExecutionResult> {
        self.dispatch_with(method, operation, context, Map::new())
            .await
    }

    /// Like [`Dispatcher::dispatch`], merging `extra` into the execution
    /// context after the context factory ran.
    pub async fn dispatch_with(
        &self,
        method: &Method,
        operation: NormalizedOperation,
        context: RequestContext,
        extra: Map<String, Value>,
    ) -> SdkResult<ExecutionResult> {
        let schema = self.schema.load().await.map_err(|err| {
            error!(error = %err, cause = ?err.source, "failed to load schema");
            SdkError::from(err)
        })?;

        let primitives = self.pipeline.primitives();
        let mut context = match primitives.context_factory(context).await {
            Ok(context) => context,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "context factory failed");
                let errors = primitives.process_errors(vec![err.to_field_error()]);
                return Ok(single_errors(StatusCode::INTERNAL_SERVER_ERROR, errors));
            }
        };
        context.extend(extra);

        let document = match primitives.parse(&operation.query) {
            Ok(document) => document,
            Err(errors) => return Ok(single_errors(StatusCode::BAD_REQUEST, errors)),
        };
        let kind = match select_operation(&document, operation.operation_name.as_deref()) {
            Ok(selected) => selected.operation,
            Err(error) => {
                let errors = primitives.process_errors(vec![error]);
                return Ok(single_errors(StatusCode::BAD_REQUEST, errors));
            }
        };
        if kind == OperationType::Mutation && *method == Method::GET {
            let error = FieldError::request("Can only perform a mutation operation from a POST request.");
            let errors = primitives.process_errors(vec![error]);
            return Ok(ExecutionResult::Single(
                SingleResponse::from_errors(StatusCode::METHOD_NOT_ALLOWED, errors)
                    .with_header(ALLOW, HeaderValue::from_static("POST")),
            ));
        }

        let errors = primitives.validate(&schema, &document);
        if !errors.is_empty() {
            return Ok(single_errors(StatusCode::BAD_REQUEST, errors));
        }

        let args = ExecutionArgs::new(schema, document)
            .with_operation_name(operation.operation_name)
            .with_variables(operation.variables)
            .with_context(context);
        Ok(run(&primitives, kind, args).await)
    }
}

async fn run(primitives: &PipelinePrimitives, kind: OperationType, args: ExecutionArgs) -> ExecutionResult {
    if kind == OperationType::Subscription {
        return match primitives.subscribe(args).await {
            Ok(events) => ExecutionResult::Live(Subscription::new(events)),
            Err(response) => single(&response),
        };
    }
    match primitives.execute(args).await {
        Execution::Single(response) => single(&response),
        Execution::Incremental(payloads) => ExecutionResult::Incremental(Subscription::new(payloads)),
    }
}

/// 400 when execution never started because of the request itself, 200
/// otherwise.
fn single(response: &Response) -> ExecutionResult {
    let rejected = response.data.is_none()
        && response
            .errors
            .iter()
            .flatten()
            .any(|e| e.origin == ErrorOrigin::Request);
    let status = if rejected {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    ExecutionResult::Single(SingleResponse::from_response(status, response))
}

fn single_errors(status: StatusCode, errors: Vec<FieldError>) -> ExecutionResult {
    ExecutionResult::Single(SingleResponse::from_errors(status, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineOptions;
    use gqlmux_runtime::{ObjectDef, ResolverError, SchemaBuilder, SchemaLoadError, StaticSchema, TypeRef};
    use http_body_util::Full;
    use hyper::header::CONTENT_TYPE;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let schema = SchemaBuilder::new()
            .object(
                ObjectDef::new("Query")
                    .field("version", TypeRef::named("String"))
                    .field("secret", TypeRef::named("String")),
            )
            .object(ObjectDef::new("Mutation").field("bump", TypeRef::named("Int")))
            .mutation_type("Mutation")
            .resolver_fn("Query", "version", |_, _, _, _| Ok(json!("1.0.0")))
            .resolver_fn("Query", "secret", |_, _, _, _| {
                Err(ResolverError::custom("stack trace at db.rs:42"))
            })
            .resolver_fn("Mutation", "bump", |_, _, _, _| Ok(json!(1)))
            .build()
            .unwrap();
        Dispatcher::new(
            Pipeline::build(PipelineOptions::new()).unwrap(),
            Arc::new(StaticSchema::new(schema)),
        )
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/graphql")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: hyper::Response<BoxBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_single_response() {
        let response = dispatcher()
            .handle(post(r#"{"query":"{ version }"}"#), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        assert_eq!(body_json(response).await, json!({"data": {"version": "1.0.0"}}));
    }

    #[tokio::test]
    async fn test_resolver_errors_are_masked() {
        let response = dispatcher()
            .handle(post(r#"{"query":"{ secret }"}"#), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["message"], json!("Unexpected error."));
        assert!(!body.to_string().contains("db.rs"));
    }

    #[tokio::test]
    async fn test_status_codes() {
        let d = dispatcher();

        let syntax = d.handle(post(r#"{"query":"{ version"}"#), RequestContext::new()).await.unwrap();
        assert_eq!(syntax.status(), StatusCode::BAD_REQUEST);

        let invalid = d.handle(post(r#"{"query":"{ nope }"}"#), RequestContext::new()).await.unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(invalid).await["errors"][0]["message"],
            json!("Cannot query field \"nope\" on type \"Query\".")
        );

        let malformed = d.handle(post(r#"{"variables":{}}"#), RequestContext::new()).await.unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let get_mutation = Request::builder()
            .method("GET")
            .uri("/graphql?query=mutation%20%7B%20bump%20%7D")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = d.handle(get_mutation, RequestContext::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");
    }

    #[tokio::test]
    async fn test_deeply_nested_document_is_rejected() {
        let d = dispatcher();
        let query = format!("{}{}", "{a".repeat(10_000), "}".repeat(10_000));
        let response = d
            .handle(post(&format!(r#"{{"query":"{query}"}}"#)), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["errors"][0]["message"],
            json!("Syntax Error: Document nested too deeply.")
        );

        let ok = d.handle(post(r#"{"query":"{ version }"}"#), RequestContext::new()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_limit() {
        let d = dispatcher().with_upload_limit(16);
        let response = d
            .handle(post(r#"{"query":"{ version version version }"}"#), RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_context_failure_is_500() {
        let pipeline = Pipeline::build(
            PipelineOptions::new()
                .context_extender(|_| async { Err(SdkError::internal("vault sealed")) }),
        )
        .unwrap();
        let schema = SchemaBuilder::new()
            .object(ObjectDef::new("Query").field("version", TypeRef::named("String")))
            .build()
            .unwrap();
        let d = Dispatcher::new(pipeline, Arc::new(StaticSchema::new(schema)));

        let response = d.handle(post(r#"{"query":"{ version }"}"#), RequestContext::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body, json!({"errors": [{"message": "Unexpected error."}]}));
    }

    struct Broken;

    #[async_trait::async_trait]
    impl SchemaProvider for Broken {
        async fn load(&self) -> Result<Arc<gqlmux_runtime::Schema>, SchemaLoadError> {
            Err(SchemaLoadError::new("registry unreachable"))
        }
    }

    #[tokio::test]
    async fn test_schema_load_failure_is_returned() {
        let d = Dispatcher::new(Pipeline::build(PipelineOptions::new()).unwrap(), Arc::new(Broken));
        let err = d
            .handle(post(r#"{"query":"{ version }"}"#), RequestContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaLoadError);
    }
}
