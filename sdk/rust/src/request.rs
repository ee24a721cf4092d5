//! Request normalization.
//!
//! Turns an HTTP request into `{operationName, query, variables, extensions}`
//! regardless of how the client encoded it.

use crate::error::{SdkError, SdkResult};
use hyper::header::CONTENT_TYPE;
use hyper::http::request::Parts;
use hyper::Method;
use memchr::memmem;
use serde_json::{Map, Value};

/// The GraphQL parameters of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedOperation {
    pub operation_name: Option<String>,
    pub query: String,
    pub variables: Map<String, Value>,
    pub extensions: Option<Map<String, Value>>,
}

impl NormalizedOperation {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Builds an operation from a JSON object such as a POST body or the
    /// payload of a WebSocket `subscribe` message.
    pub fn from_json(value: Value) -> SdkResult<Self> {
        let Value::Object(mut params) = value else {
            return Err(SdkError::malformed(format!(
                "POST body is expected to be an object, but given {}.",
                type_name(&value)
            )));
        };

        let query = match params.remove("query") {
            None | Some(Value::Null) => {
                return Err(SdkError::malformed("Must provide query string."))
            }
            Some(Value::String(query)) => query,
            Some(other) => {
                return Err(SdkError::malformed(format!(
                    "Expected \"query\" param to be a string, but given {}.",
                    type_name(&other)
                )))
            }
        };
        let operation_name = match params.remove("operationName") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name),
            Some(other) => {
                return Err(SdkError::malformed(format!(
                    "Expected \"operationName\" param to be a string, but given {}.",
                    type_name(&other)
                )))
            }
        };

        Ok(Self {
            operation_name,
            query,
            variables: object_param("variables", params.remove("variables"))?
                .unwrap_or_default(),
            extensions: object_param("extensions", params.remove("extensions"))?,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Accepts an object, or a string holding a JSON object as sent in query
/// strings and some form encodings.
fn object_param(name: &str, value: Option<Value>) -> SdkResult<Option<Map<String, Value>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(Value::Null) => Ok(None),
            Ok(other) => Err(SdkError::malformed(format!(
                "Expected \"{name}\" param to be an object, but given {}.",
                type_name(&other)
            ))),
            Err(_) => Err(SdkError::malformed(format!(
                "Expected \"{name}\" param to be valid JSON."
            ))),
        },
        Some(other) => Err(SdkError::malformed(format!(
            "Expected \"{name}\" param to be an object, but given {}.",
            type_name(&other)
        ))),
    }
}

/// Extracts the GraphQL parameters from a request.
pub fn normalize(parts: &Parts, body: &[u8]) -> SdkResult<NormalizedOperation> {
    match parts.method {
        Method::GET => from_query_string(parts.uri.query().unwrap_or_default()),
        Method::POST => from_body(parts, body),
        _ => Err(SdkError::method_not_allowed(
            "GraphQL only supports GET and POST requests.",
        )),
    }
}

fn from_query_string(query: &str) -> SdkResult<NormalizedOperation> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
        .map_err(|e| SdkError::malformed(format!("Invalid query string: {e}")))?;
    let params: Map<String, Value> = pairs
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    NormalizedOperation::from_json(Value::Object(params))
}

fn from_body(parts: &Parts, body: &[u8]) -> SdkResult<NormalizedOperation> {
    let content_type = match parts.headers.get(CONTENT_TYPE) {
        None => None,
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| SdkError::malformed("Invalid Content-Type header."))?;
            Some(text.parse::<mime::Mime>().map_err(|_| {
                SdkError::malformed(format!("Invalid Content-Type header \"{text}\"."))
            })?)
        }
    };

    let Some(content_type) = content_type else {
        return from_json_bytes(body);
    };
    match (content_type.type_(), content_type.subtype().as_str()) {
        (mime::APPLICATION, "json") => from_json_bytes(body),
        (mime::APPLICATION, subtype) if subtype.ends_with("+json") => from_json_bytes(body),
        (mime::APPLICATION, "graphql") => {
            let query = std::str::from_utf8(body)
                .map_err(|_| SdkError::malformed("Request body is not valid UTF-8."))?;
            if query.trim().is_empty() {
                return Err(SdkError::malformed("Must provide query string."));
            }
            Ok(NormalizedOperation::new(query))
        }
        (mime::MULTIPART, "form-data") => {
            let boundary = content_type
                .get_param(mime::BOUNDARY)
                .ok_or_else(|| SdkError::malformed("Multipart request is missing a boundary."))?;
            let operations = multipart_field(body, boundary.as_str(), "operations")
                .ok_or_else(|| {
                    SdkError::malformed("Multipart request is missing the \"operations\" field.")
                })?;
            from_json_bytes(operations)
        }
        _ => Err(SdkError::malformed(format!(
            "Unsupported content type \"{content_type}\"."
        ))),
    }
}

fn from_json_bytes(body: &[u8]) -> SdkResult<NormalizedOperation> {
    if body.is_empty() {
        return Err(SdkError::malformed("Must provide query string."));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| SdkError::malformed("POST body sent invalid JSON."))?;
    NormalizedOperation::from_json(value)
}

/// Returns the content of the named field of a `multipart/form-data` body.
fn multipart_field<'a>(body: &'a [u8], boundary: &str, name: &str) -> Option<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let positions: Vec<usize> = memmem::find_iter(body, delimiter.as_bytes()).collect();

    positions.windows(2).find_map(|window| {
        let part = &body[window[0] + delimiter.len()..window[1]];
        let part = part.strip_prefix(b"\r\n")?;
        let header_end = memmem::find(part, b"\r\n\r\n")?;
        let headers = std::str::from_utf8(&part[..header_end]).ok()?;
        let content = &part[header_end + 4..];
        let content = content.strip_suffix(b"\r\n").unwrap_or(content);

        (field_name(headers)? == name).then_some(content)
    })
}

fn field_name(headers: &str) -> Option<&str> {
    let disposition = headers.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then_some(value)
    })?;
    disposition.split(';').find_map(|param| {
        let value = param.trim().strip_prefix("name=")?;
        Some(value.trim_matches('"'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use hyper::Request;
    use serde_json::json;

    fn parts(method: &str, uri: &str, content_type: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_get_query_string() {
        let parts = parts(
            "GET",
            "/graphql?query=query%20Q(%24id%3A%20ID)%20%7B%20user(id%3A%20%24id)%20%7B%20name%20%7D%20%7D&operationName=Q&variables=%7B%22id%22%3A%221%22%7D",
            None,
        );
        let op = normalize(&parts, b"").unwrap();
        assert_eq!(op.query, "query Q($id: ID) { user(id: $id) { name } }");
        assert_eq!(op.operation_name.as_deref(), Some("Q"));
        assert_eq!(op.variables["id"], json!("1"));
    }

    #[test]
    fn test_json_body() {
        let parts = parts("POST", "/graphql", Some("application/json; charset=utf-8"));
        let body = br#"{"query":"{ version }","variables":{"a":1},"extensions":{"persistedQuery":{}}}"#;
        let op = normalize(&parts, body).unwrap();
        assert_eq!(op.query, "{ version }");
        assert_eq!(op.variables["a"], json!(1));
        assert!(op.extensions.unwrap().contains_key("persistedQuery"));
    }

    #[test]
    fn test_missing_content_type_is_json() {
        let parts = parts("POST", "/graphql", None);
        let op = normalize(&parts, br#"{"query":"{ a }","variables":null}"#).unwrap();
        assert!(op.variables.is_empty());
    }

    #[test]
    fn test_graphql_body() {
        let parts = parts("POST", "/graphql", Some("application/graphql"));
        let op = normalize(&parts, b"{ version }").unwrap();
        assert_eq!(op.query, "{ version }");
    }

    #[test]
    fn test_multipart_operations_field() {
        let parts = parts(
            "POST",
            "/graphql",
            Some("multipart/form-data; boundary=----xyz"),
        );
        let body = concat!(
            "------xyz\r\n",
            "Content-Disposition: form-data; name=\"operations\"\r\n\r\n",
            "{\"query\":\"mutation ($file: Upload!) { upload(file: $file) }\",\"variables\":{\"file\":null}}\r\n",
            "------xyz\r\n",
            "Content-Disposition: form-data; name=\"map\"\r\n\r\n",
            "{\"0\":[\"variables.file\"]}\r\n",
            "------xyz\r\n",
            "Content-Disposition: form-data; name=\"0\"; filename=\"a.txt\"\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "hello\r\n",
            "------xyz--\r\n",
        );
        let op = normalize(&parts, body.as_bytes()).unwrap();
        assert_eq!(
            op.query,
            "mutation ($file: Upload!) { upload(file: $file) }"
        );
        assert_eq!(op.variables["file"], Value::Null);
    }

    #[test]
    fn test_errors() {
        let post = parts("POST", "/graphql", Some("application/json"));

        let err = normalize(&post, br#"{"variables":{}}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedRequest);
        assert_eq!(err.message, "Must provide query string.");

        let err = normalize(&post, b"{not json").unwrap_err();
        assert_eq!(err.message, "POST body sent invalid JSON.");

        let err = normalize(&post, br#"{"query":"{ a }","variables":[1]}"#).unwrap_err();
        assert_eq!(
            err.message,
            "Expected \"variables\" param to be an object, but given array."
        );

        let get = parts("GET", "/graphql?query=%7B%20a%20%7D&variables=oops", None);
        assert_eq!(normalize(&get, b"").unwrap_err().code, ErrorCode::MalformedRequest);

        let put = parts("PUT", "/graphql", None);
        assert_eq!(
            normalize(&put, b"").unwrap_err().code,
            ErrorCode::MethodNotAllowed
        );

        let xml = parts("POST", "/graphql", Some("text/xml"));
        assert_eq!(normalize(&xml, b"<q/>").unwrap_err().code, ErrorCode::MalformedRequest);
    }
}
