//! The [`Message`] trait and the wrapper types the router understands.
//!
//! A message is any serde-serializable type with a stable, versioned type
//! name. The type name is what travels in the `x-message-type` header and
//! what the routing engine and the subscriber registry key on.
//!
//! # Naming convention
//!
//! Use a descriptive name with a version suffix so schemas can evolve:
//!
//! - `"OrderPlaced.v1"`
//! - `"InventoryAdjusted.v2"` (after a schema change)
//!
//! # Example
//!
//! ```
//! use silverback_core::message::Message;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//!     total_cents: i64,
//! }
//!
//! impl Message for OrderPlaced {
//!     fn message_type() -> &'static str {
//!         "OrderPlaced.v1"
//!     }
//! }
//! ```

use crate::headers::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// A routable message.
///
/// The type name is a *type-level* property: every producer endpoint is bound
/// to exactly one message type, and routing matches the published value's
/// type name against the endpoints' configured names. Wrapper types
/// ([`Tombstone`], [`WithHeaders`]) route as their inner type.
///
/// # Thread Safety
///
/// Messages must be `Send + Sync + 'static` so they can cross task
/// boundaries inside the producer pipeline.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name written to `x-message-type` and used for routing.
    fn message_type() -> &'static str;

    /// Self-validation, consulted by the pipeline validate stage according
    /// to the endpoint's validation mode.
    ///
    /// Return every violated constraint as a human-readable string. The
    /// default implementation accepts everything.
    ///
    /// # Errors
    ///
    /// Returns the list of violated constraints.
    fn validate(&self) -> Result<(), Vec<String>> {
        Ok(())
    }
}

/// A deletion marker: a null payload published under a known message type.
///
/// Tombstones route exactly like a value of `M` and are produced with an
/// empty payload. The record key identifies what is being deleted.
///
/// # Example
///
/// ```
/// use silverback_core::message::{Message, Tombstone};
/// # use serde::{Serialize, Deserialize};
/// # #[derive(Clone, Debug, Serialize, Deserialize)]
/// # struct OrderPlaced;
/// # impl Message for OrderPlaced {
/// #     fn message_type() -> &'static str { "OrderPlaced.v1" }
/// # }
///
/// let tombstone = Tombstone::<OrderPlaced>::new("order-42");
/// assert_eq!(tombstone.key(), "order-42");
/// ```
#[derive(Clone, Debug)]
pub struct Tombstone<M: Message> {
    key: String,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> Tombstone<M> {
    /// Create a tombstone for the record identified by `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _marker: PhantomData,
        }
    }

    /// The record key being deleted.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The inner message type name this tombstone routes as.
    #[must_use]
    pub fn message_type() -> &'static str {
        M::message_type()
    }
}

/// A message bundled with additional outbound headers.
///
/// Routes as the inner type; the carried headers are appended to the
/// envelope before the enrichment stage runs.
#[derive(Clone, Debug)]
pub struct WithHeaders<M: Message> {
    message: M,
    headers: HeaderMap,
}

impl<M: Message> WithHeaders<M> {
    /// Wrap `message` with extra headers.
    #[must_use]
    pub const fn new(message: M, headers: HeaderMap) -> Self {
        Self { message, headers }
    }

    /// The wrapped message.
    #[must_use]
    pub const fn message(&self) -> &M {
        &self.message
    }

    /// The extra headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Split into message and headers.
    #[must_use]
    pub fn into_parts(self) -> (M, HeaderMap) {
        (self.message, self.headers)
    }
}
