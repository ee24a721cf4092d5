//! The upstream request context handed to the pipeline.
//!
//! Middleware in front of the dispatcher fills in `info`, `config` and `auth`.
//! The pipeline's context factory turns them into the execution
//! [`Context`](gqlmux_runtime::Context) that resolvers see.

use gqlmux_runtime::Context;
use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request-scoped values propagated unchanged into execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub info: Value,
    pub config: Value,
    pub auth: Value,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describes the HTTP request under `info`: method, path, query string
    /// and headers with lowercase names. Non UTF-8 header values are skipped.
    pub fn from_parts(parts: &Parts) -> Self {
        let mut headers = Map::new();
        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        let mut info = Map::new();
        info.insert("method".into(), Value::String(parts.method.to_string()));
        info.insert("path".into(), Value::String(parts.uri.path().to_string()));
        if let Some(query) = parts.uri.query() {
            info.insert("query".into(), Value::String(query.to_string()));
        }
        info.insert("headers".into(), Value::Object(headers));

        Self {
            info: Value::Object(info),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Value) -> Self {
        self.auth = auth;
        self
    }

    /// Reads one request header recorded by [`RequestContext::from_parts`].
    pub fn header(&self, name: &str) -> Option<&str> {
        self.info
            .get("headers")?
            .get(name.to_ascii_lowercase())?
            .as_str()
    }

    /// The base execution context: `info`, `config` and `auth` as top level
    /// fields.
    pub fn into_context(self) -> Context {
        let mut map = Map::new();
        map.insert("info".into(), self.info);
        map.insert("config".into(), self.config);
        map.insert("auth".into(), self.auth);
        Context::from_map(map)
    }
}
