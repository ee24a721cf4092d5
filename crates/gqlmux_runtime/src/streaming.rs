//! Incremental delivery payloads (`@defer` / `@stream`) and cancellable
//! subscriptions.

use crate::error::{FieldError, PathSegment};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// One part of an incremental response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental: Option<Vec<IncrementalItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    pub has_next: bool,
}

impl IncrementalPayload {
    /// The first payload: the non-deferred part of the result.
    pub fn initial(data: Option<Value>, errors: Vec<FieldError>, has_next: bool) -> Self {
        Self {
            data,
            errors: (!errors.is_empty()).then_some(errors),
            incremental: None,
            extensions: None,
            has_next,
        }
    }

    /// A subsequent payload carrying one completed item.
    pub fn subsequent(item: IncrementalItem, has_next: bool) -> Self {
        Self {
            data: None,
            errors: None,
            incremental: Some(vec![item]),
            extensions: None,
            has_next,
        }
    }

    /// Applies `f` to every error list in this payload, including the lists of
    /// incremental items.
    pub fn map_errors<F>(&mut self, mut f: F)
    where
        F: FnMut(Vec<FieldError>) -> Vec<FieldError>,
    {
        if let Some(errors) = self.errors.take() {
            self.errors = Some(f(errors));
        }
        for item in self.incremental.iter_mut().flatten() {
            let slot = item.errors_mut();
            if let Some(errors) = slot.take() {
                *slot = Some(f(errors));
            }
        }
    }

    /// Iterates over every error in this payload.
    pub fn errors(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter().flatten().chain(
            self.incremental
                .iter()
                .flatten()
                .flat_map(|item| item.errors().iter()),
        )
    }
}

/// A completed deferred fragment or streamed list item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IncrementalItem {
    Defer {
        data: Option<Value>,
        path: Vec<PathSegment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<FieldError>>,
    },
    Stream {
        items: Option<Vec<Value>>,
        path: Vec<PathSegment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<FieldError>>,
    },
}

impl IncrementalItem {
    fn errors_mut(&mut self) -> &mut Option<Vec<FieldError>> {
        match self {
            Self::Defer { errors, .. } | Self::Stream { errors, .. } => errors,
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            Self::Defer { errors, .. } | Self::Stream { errors, .. } => {
                errors.as_deref().unwrap_or_default()
            }
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Defer { path, .. } | Self::Stream { path, .. } => path,
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A cancellable asynchronous sequence.
///
/// The underlying source is released exactly once: on natural completion, on
/// [`Subscription::unsubscribe`], after a [`SubscriptionHandle`] cancels it, or
/// on drop, whichever happens first.
pub struct Subscription<T> {
    source: Option<BoxStream<'static, T>>,
    token: CancellationToken,
    on_release: Vec<ReleaseHook>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> Subscription<T> {
    pub fn new(source: BoxStream<'static, T>) -> Self {
        Self {
            source: Some(source),
            token: CancellationToken::new(),
            on_release: Vec::new(),
        }
    }

    /// A subscription that yields the given items in order.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures_util::stream::iter(items).boxed())
    }

    /// Transforms every item. Release hooks and handles are kept.
    pub fn map<U, F>(mut self, f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let source = self.source.take().map(|s| s.map(f).boxed());
        Subscription {
            source,
            token: self.token.clone(),
            on_release: std::mem::take(&mut self.on_release),
        }
    }
}

impl<T> Subscription<T> {
    /// Registers a hook that runs when the source is released.
    #[must_use]
    pub fn on_unsubscribe(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release.push(Box::new(hook));
        self
    }

    /// Binds this subscription to an existing handle, replacing its own
    /// cancellation token. Handles issued earlier no longer reach it.
    #[must_use]
    pub fn with_handle(mut self, handle: &SubscriptionHandle) -> Self {
        self.token = handle.token.clone();
        self
    }

    /// Returns a cloneable handle that can cancel this subscription remotely.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            token: self.token.clone(),
        }
    }

    /// Returns true while the source has not been released.
    pub fn is_active(&self) -> bool {
        self.source.is_some()
    }

    /// Waits for the next item. Returns `None` once the source completed or the
    /// subscription was cancelled; the source is released at that point.
    pub async fn next(&mut self) -> Option<T> {
        let source = self.source.as_mut()?;
        let item = tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            item = source.next() => item,
        };
        if item.is_none() {
            self.release();
        }
        item
    }

    /// Stops the subscription and releases its source. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.token.cancel();
        self.release();
    }

    fn release(&mut self) {
        if let Some(source) = self.source.take() {
            drop(source);
            for hook in self.on_release.drain(..) {
                hook();
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Remote unsubscribe for a [`Subscription`].
///
/// A handle can be created before the subscription it controls exists and
/// attached later with [`Subscription::with_handle`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the subscription. The owner releases the source on its next
    /// poll or when it is dropped.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`SubscriptionHandle::unsubscribe`] was called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted<T: Send + 'static>(sub: Subscription<T>, counter: &Arc<AtomicUsize>) -> Subscription<T> {
        let counter = Arc::clone(counter);
        sub.on_unsubscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_yields_in_order_then_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sub = counted(Subscription::from_iter(vec![1, 2, 3]), &releases);

        assert_eq!(sub.next().await, Some(1));
        assert_eq!(sub.next().await, Some(2));
        assert_eq!(sub.next().await, Some(3));
        assert_eq!(sub.next().await, None);
        assert!(!sub.is_active());

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sub = counted(Subscription::new(futures_util::stream::pending::<i32>().boxed()), &releases);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.next().await, None);
        drop(sub);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_wakes_pending_next() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sub = counted(Subscription::new(futures_util::stream::pending::<i32>().boxed()), &releases);
        let handle = sub.handle();

        let waiter = tokio::spawn(async move {
            let item = sub.next().await;
            (item, sub.is_active())
        });
        handle.unsubscribe();

        let (item, active) = waiter.await.unwrap();
        assert_eq!(item, None);
        assert!(!active);
        assert!(handle.is_unsubscribed());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_created_before_subscription() {
        let releases = Arc::new(AtomicUsize::new(0));
        let handle = SubscriptionHandle::new();
        handle.unsubscribe();

        let mut sub = counted(Subscription::from_iter(vec![1, 2]), &releases).with_handle(&handle);
        assert_eq!(sub.next().await, None);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let sub = counted(Subscription::from_iter(vec![1]), &releases);
        drop(sub);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_map_keeps_hooks() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sub = counted(Subscription::from_iter(vec![1, 2]), &releases).map(|n| n * 10);

        assert_eq!(sub.next().await, Some(10));
        sub.unsubscribe();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_shape() {
        let initial = IncrementalPayload::initial(Some(json!({"user": {"id": "1"}})), Vec::new(), true);
        assert_eq!(
            serde_json::to_value(&initial).unwrap(),
            json!({"data": {"user": {"id": "1"}}, "hasNext": true})
        );

        let item = IncrementalItem::Defer {
            data: Some(json!({"name": "Alice"})),
            path: vec!["user".into()],
            label: Some("profile".into()),
            errors: None,
        };
        let subsequent = IncrementalPayload::subsequent(item, false);
        assert_eq!(
            serde_json::to_value(&subsequent).unwrap(),
            json!({
                "incremental": [{"data": {"name": "Alice"}, "path": ["user"], "label": "profile"}],
                "hasNext": false
            })
        );
    }

    #[test]
    fn test_map_errors_reaches_items() {
        let item = IncrementalItem::Stream {
            items: Some(vec![json!(null)]),
            path: vec!["numbers".into(), 2.into()],
            label: None,
            errors: Some(vec![FieldError::new("boom")]),
        };
        let mut payload = IncrementalPayload::subsequent(item, true);
        payload.map_errors(|errors| {
            errors
                .into_iter()
                .map(|mut e| {
                    e.message = "hidden".into();
                    e
                })
                .collect()
        });

        let messages: Vec<_> = payload.errors().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["hidden"]);
    }
}
