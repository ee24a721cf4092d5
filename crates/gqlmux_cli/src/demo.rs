//! Schema served by `gqlmux serve`.
//!
//! ```graphql
//! type Query { version: String  hello(name: String = "world"): String  slow: String }
//! type Mutation { publish(text: String!): Int }
//! type Subscription { messages: String  countdown(from: Int = 3): Int }
//! ```

use futures_util::stream::{self, StreamExt};
use gqlmux_sdk::runtime::{
    FieldDef, ObjectDef, ResolverError, Schema, SchemaBuilder, SchemaError, TypeRef,
};
use gqlmux_sdk::PubSub;
use serde_json::json;
use std::time::Duration;

pub const MESSAGES_TOPIC: &str = "messages";

pub fn schema(pubsub: &PubSub) -> Result<Schema, SchemaError> {
    let publisher = pubsub.clone();
    let subscriber = pubsub.clone();

    SchemaBuilder::new()
        .object(
            ObjectDef::new("Query")
                .field("version", TypeRef::named("String"))
                .field_def(
                    FieldDef::new("hello", TypeRef::named("String")).argument(
                        "name",
                        TypeRef::named("String"),
                        Some(json!("world")),
                    ),
                )
                .field("slow", TypeRef::named("String")),
        )
        .object(ObjectDef::new("Mutation").field_def(
            FieldDef::new("publish", TypeRef::named("Int")).argument(
                "text",
                TypeRef::non_null(TypeRef::named("String")),
                None,
            ),
        ))
        .object(
            ObjectDef::new("Subscription")
                .field("messages", TypeRef::named("String"))
                .field_def(
                    FieldDef::new("countdown", TypeRef::named("Int")).argument(
                        "from",
                        TypeRef::named("Int"),
                        Some(json!(3)),
                    ),
                ),
        )
        .mutation_type("Mutation")
        .subscription_type("Subscription")
        .resolver_fn("Query", "version", |_, _, _, _| {
            Ok(json!(env!("CARGO_PKG_VERSION")))
        })
        .resolver_fn("Query", "hello", |_, args, _, _| {
            let name: String = args.get_as("name").unwrap_or_else(|| "world".into());
            Ok(json!(format!("Hello, {name}!")))
        })
        .resolver_async("Query", "slow", |_, _, _, _| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("finally"))
        })
        .resolver_async("Mutation", "publish", move |_, args, _, _| {
            let pubsub = publisher.clone();
            async move {
                let text: String = args.require("text")?;
                let delivered = pubsub.publish(MESSAGES_TOPIC, json!(text)).await;
                Ok(json!(delivered))
            }
        })
        .subscription_fn("messages", move |_, _| {
            let pubsub = subscriber.clone();
            async move { Ok(pubsub.stream(MESSAGES_TOPIC).await) }
        })
        .subscription_fn("countdown", |args, _| async move {
            let from: i64 = args.get_as("from").unwrap_or(3);
            if from < 0 {
                return Err(ResolverError::public("\"from\" must not be negative."));
            }
            let ticks = stream::iter((0..=from).rev())
                .then(|n| async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(json!(n))
                })
                .boxed();
            Ok(ticks)
        })
        .build()
}
