//! # Fact Store
//!
//! An event-sourcing fact store: an append-only log of immutable, versioned
//! facts with catchup and follow subscriptions, optimistic-concurrency
//! publishing and payload schema transformation.
//!
//! ## Core Concepts
//!
//! - **Facts**: Immutable events with a header (namespace, type, version,
//!   aggregate ids, meta) and a JSON payload, ordered by a store-assigned serial
//! - **Subscriptions**: Replay matching history in pages, then optionally
//!   follow new facts as they are published
//! - **State tokens**: Snapshots of "last fact per aggregate" that guard a
//!   publish against concurrent changes
//! - **Transformations**: Registered steps converting payloads between
//!   schema versions
//!
//! ## Example
//!
//! ```ignore
//! use factstore::{Fact, FactSpec, FactStore, StoreConfig, SubscriptionRequest};
//!
//! let store = FactStore::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//!
//! // Publish a fact
//! store.publish(vec![Fact::new("users", json!({ "name": "ada" })).with_type("Created")])?;
//!
//! // Follow everything in a namespace
//! let (subscription, events) = store.subscribe_channel(
//!     SubscriptionRequest::follow(vec![FactSpec::ns("users")]),
//!     1024,
//! )?;
//!
//! // Guarded publish
//! let token = store.create_token(&store.state_for([user_id]))?;
//! let published = store.publish_if_unchanged(facts, &token)?;
//! ```

pub mod db;
pub mod error;
pub mod query;
pub mod store;
pub mod subscription;
pub mod tokens;
pub mod transform;
pub mod types;

// Re-exports
pub use error::{Result, StoreError};
pub use query::{FactQuery, FactSpec, FilterExpr, PostQueryMatcher, QueryBuilder};
pub use store::{FactStore, StoreConfig};
pub use subscription::{
    from_fn, ChannelObserver, DebouncedTrigger, ErrorPolicy, FactObserver, Phase, Subscription,
    SubscriptionEvent, SubscriptionId, SubscriptionRequest, SubscriptionStats, TimerPool,
};
pub use tokens::{StateSnapshot, StateToken, TokenStore};
pub use transform::{
    RequestedVersions, TransformationChain, TransformationRegistry, Transformations, Transformer,
};
pub use types::*;
