//! Wire framing for the three transport modes.
//!
//! ```text
//! single       200 application/json; charset=utf-8
//! incremental  multipart/mixed; boundary="-"
//!              ---
//!              \r\nContent-Type: application/json; charset=utf-8
//!              \r\nContent-Length: N\r\n\r\n{json}\r\n---      (hasNext)
//!              ...
//!              \r\n-----\r\n
//! live         text/event-stream
//!              data: {json}\n\n
//! ```
//!
//! Streaming bodies own their [`Subscription`]. Dropping the body, which is
//! what hyper does when the client goes away or a write fails, releases the
//! source.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use gqlmux_runtime::{FieldError, IncrementalPayload, Response, Subscription};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING,
};
use hyper::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use tracing::error;

/// Response body type shared by every route.
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, Infallible>;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/mixed; boundary=\"-\"";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

const MULTIPART_START: &[u8] = b"---";
const MULTIPART_DELIMITER: &[u8] = b"\r\n---";
const MULTIPART_END: &[u8] = b"\r\n-----\r\n";
const PART_HEADERS: &[u8] = b"\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: ";

pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).boxed_unsync()
}

fn streaming(chunks: BoxStream<'static, Bytes>) -> BoxBody {
    StreamBody::new(chunks.map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)))).boxed_unsync()
}

/// A complete single-shot response.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub payload: Value,
}

impl SingleResponse {
    /// A JSON response with the given status.
    pub fn json(status: StatusCode, payload: Value) -> Self {
        Self {
            status,
            headers: vec![(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE))],
            payload,
        }
    }

    pub fn from_response(status: StatusCode, response: &Response) -> Self {
        Self::json(status, to_value(response))
    }

    /// A data-less response carrying only `errors`.
    pub fn from_errors(status: StatusCode, errors: Vec<FieldError>) -> Self {
        Self::from_response(status, &Response::from_errors(errors))
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn into_http(self) -> hyper::Response<BoxBody> {
        let mut response = hyper::Response::new(full(self.payload.to_string()));
        *response.status_mut() = self.status;
        for (name, value) in self.headers {
            response.headers_mut().append(name, value);
        }
        response
    }
}

/// How an operation's result travels to the client.
#[derive(Debug)]
pub enum ExecutionResult {
    Single(SingleResponse),
    Incremental(Subscription<IncrementalPayload>),
    Live(Subscription<Response>),
}

impl ExecutionResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Incremental(_) => "incremental",
            Self::Live(_) => "live",
        }
    }

    /// Frames the result as an HTTP response.
    pub fn into_http(self) -> hyper::Response<BoxBody> {
        match self {
            Self::Single(single) => single.into_http(),
            Self::Incremental(subscription) => {
                let mut response = hyper::Response::new(streaming(multipart_stream(subscription)));
                let headers = response.headers_mut();
                headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(MULTIPART_CONTENT_TYPE));
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                response
            }
            Self::Live(subscription) => {
                let mut response = hyper::Response::new(streaming(event_stream(subscription)));
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE));
                headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|error| {
        error!(%error, "failed to serialize payload");
        serde_json::json!({"errors": [{"message": "Unexpected error."}]})
    })
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(to_value(value).to_string())
}

/// One multipart part: headers and JSON, without the trailing delimiter.
fn encode_part(payload: &IncrementalPayload) -> BytesMut {
    let json = encode(payload);
    let length = json.len().to_string();
    let mut part = BytesMut::with_capacity(PART_HEADERS.len() + length.len() + 4 + json.len() + 5);
    part.extend_from_slice(PART_HEADERS);
    part.extend_from_slice(length.as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(&json);
    part
}

enum Multipart {
    Start,
    Parts,
    Closing,
    Done,
}

/// Body chunks of an incremental response.
pub fn multipart_stream(
    subscription: Subscription<IncrementalPayload>,
) -> BoxStream<'static, Bytes> {
    stream::unfold(
        (subscription, Multipart::Start),
        |(mut subscription, state)| async move {
            match state {
                Multipart::Start => Some((
                    Bytes::from_static(MULTIPART_START),
                    (subscription, Multipart::Parts),
                )),
                Multipart::Parts => match subscription.next().await {
                    Some(payload) => {
                        let mut part = encode_part(&payload);
                        if payload.has_next {
                            part.extend_from_slice(MULTIPART_DELIMITER);
                            Some((part.freeze(), (subscription, Multipart::Parts)))
                        } else {
                            subscription.unsubscribe();
                            Some((part.freeze(), (subscription, Multipart::Closing)))
                        }
                    }
                    None => Some((
                        Bytes::from_static(MULTIPART_END),
                        (subscription, Multipart::Done),
                    )),
                },
                Multipart::Closing => Some((
                    Bytes::from_static(MULTIPART_END),
                    (subscription, Multipart::Done),
                )),
                Multipart::Done => None,
            }
        },
    )
    .boxed()
}

/// Body chunks of a live response: one `data:` event per response.
pub fn event_stream(subscription: Subscription<Response>) -> BoxStream<'static, Bytes> {
    stream::unfold(subscription, |mut subscription| async move {
        let response = subscription.next().await?;
        let json = encode(&response);
        let mut event = BytesMut::with_capacity(json.len() + 8);
        event.extend_from_slice(b"data: ");
        event.extend_from_slice(&json);
        event.extend_from_slice(b"\n\n");
        Some((event.freeze(), subscription))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlmux_runtime::IncrementalItem;
    use http_body_util::BodyExt;
    use hyper::header::SET_COOKIE;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn payloads() -> Vec<IncrementalPayload> {
        vec![
            IncrementalPayload::initial(Some(json!({"user": {"id": "1"}})), Vec::new(), true),
            IncrementalPayload::subsequent(
                IncrementalItem::Defer {
                    data: Some(json!({"name": "Ada"})),
                    path: vec!["user".into()],
                    label: None,
                    errors: None,
                },
                false,
            ),
        ]
    }

    #[tokio::test]
    async fn test_multipart_is_bit_exact() {
        let chunks: Vec<Bytes> = multipart_stream(Subscription::from_iter(payloads()))
            .collect()
            .await;
        let body: Vec<u8> = chunks.concat();

        let first = r#"{"data":{"user":{"id":"1"}},"hasNext":true}"#;
        let second = r#"{"incremental":[{"data":{"name":"Ada"},"path":["user"]}],"hasNext":false}"#;
        let expected = format!(
            "---\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n{first}\r\n---\
             \r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n{second}\r\n-----\r\n",
            first.len(),
            second.len(),
        );
        assert_eq!(String::from_utf8(body).unwrap(), expected);
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let payload = IncrementalPayload::initial(Some(json!({"name": "Zoë"})), Vec::new(), false);
        let json = serde_json::to_string(&payload).unwrap();
        let part = encode_part(&payload);
        let text = String::from_utf8(part.to_vec()).unwrap();
        assert!(text.contains(&format!("Content-Length: {}\r\n", json.len())));
        assert_ne!(json.len(), json.chars().count());
    }

    #[tokio::test]
    async fn test_event_stream_format() {
        let events = Subscription::from_iter(vec![
            Response::data(json!({"tick": 1})),
            Response::data(json!({"tick": 2})),
        ]);
        let chunks: Vec<Bytes> = event_stream(events).collect().await;
        assert_eq!(
            chunks.concat(),
            b"data: {\"data\":{\"tick\":1}}\n\ndata: {\"data\":{\"tick\":2}}\n\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_dropping_body_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let source = stream::iter(0..).map(|n| Response::data(json!({"n": n}))).boxed();
        let subscription = Subscription::new(source).on_unsubscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut response = ExecutionResult::Live(subscription).into_http();
        let body = response.body_mut();
        for _ in 0..3 {
            let frame = body.frame().await.unwrap().unwrap();
            assert!(frame.into_data().unwrap().starts_with(b"data: "));
        }
        drop(response);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_multipart_body_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let source = stream::iter(0..)
            .map(|n| IncrementalPayload::initial(Some(json!({"n": n})), Vec::new(), true))
            .boxed();
        let subscription = Subscription::new(source).on_unsubscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut response = ExecutionResult::Incremental(subscription).into_http();
        let body = response.body_mut();
        let preamble = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&preamble[..], b"---");
        let part = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(part.starts_with(b"\r\nContent-Type: application/json; charset=utf-8\r\n"));
        assert!(part.ends_with(b"\r\n---"));
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        drop(response);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_headers_are_kept() {
        let response = SingleResponse::json(StatusCode::OK, json!({"data": null}))
            .with_header(SET_COOKIE, HeaderValue::from_static("a=1"))
            .with_header(SET_COOKIE, HeaderValue::from_static("b=2"))
            .into_http();
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(response.headers().get_all(CONTENT_TYPE).iter().count(), 1);
    }

    #[test]
    fn test_headers() {
        let live = ExecutionResult::Live(Subscription::from_iter(Vec::new())).into_http();
        assert_eq!(live.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(live.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(live.headers()[CONNECTION], "keep-alive");

        let incremental =
            ExecutionResult::Incremental(Subscription::from_iter(Vec::new())).into_http();
        assert_eq!(
            incremental.headers()[CONTENT_TYPE],
            "multipart/mixed; boundary=\"-\""
        );
        assert_eq!(incremental.headers()[TRANSFER_ENCODING], "chunked");

        let single = ExecutionResult::Single(SingleResponse::json(
            StatusCode::OK,
            json!({"data": {"version": "1"}}),
        ))
        .into_http();
        assert_eq!(single.status(), StatusCode::OK);
        assert_eq!(single.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
    }
}
