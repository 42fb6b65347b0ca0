//! Endpoint registry and routing lookups.
//!
//! The registry owns the bound endpoints and resolves two kinds of lookup:
//!
//! - **by name**: the endpoint name or its friendly name, for explicit
//!   produces and for move error policies;
//! - **by type**: every routable endpoint bound to a message type, for the
//!   routing engine (`producers_for`).
//!
//! The registry is generic over the producer handle it stores so that it can
//! be exercised without the runtime crate; the runtime instantiates it with
//! `Arc<Producer>`.

use crate::endpoint::EndpointConfiguration;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by registration and routing lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The friendly name is already bound to another endpoint.
    #[error("friendly name '{0}' is already registered")]
    DuplicateFriendlyName(String),

    /// The endpoint name is already bound.
    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    /// No endpoint matches the requested name.
    #[error("no producer found for '{0}'")]
    ProducerNotFound(String),

    /// No routable endpoint is bound to the message type.
    #[error("no route for message type '{0}'")]
    NoRoute(String),
}

/// A registry of bound endpoints, each paired with a producer handle.
#[derive(Debug)]
pub struct EndpointRegistry<P> {
    entries: Vec<(Arc<EndpointConfiguration>, P)>,
}

impl<P> Default for EndpointRegistry<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P: Clone> EndpointRegistry<P> {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Bind an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateEndpoint`] when the endpoint name is
    /// taken and [`RoutingError::DuplicateFriendlyName`] when the (non-empty)
    /// friendly name is taken.
    pub fn register(
        &mut self,
        config: Arc<EndpointConfiguration>,
        handle: P,
    ) -> Result<(), RoutingError> {
        if self.entries.iter().any(|(c, _)| c.name() == config.name()) {
            return Err(RoutingError::DuplicateEndpoint(config.name().to_string()));
        }
        if let Some(friendly) = config.friendly_name() {
            let taken = self
                .entries
                .iter()
                .any(|(c, _)| c.friendly_name() == Some(friendly));
            if taken {
                return Err(RoutingError::DuplicateFriendlyName(friendly.to_string()));
            }
        }
        self.entries.push((config, handle));
        Ok(())
    }

    /// Look up a single endpoint by endpoint name or friendly name.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::ProducerNotFound`] when nothing matches.
    pub fn find_by_name(&self, name: &str) -> Result<(Arc<EndpointConfiguration>, P), RoutingError> {
        self.entries
            .iter()
            .find(|(c, _)| c.name() == name || c.friendly_name() == Some(name))
            .map(|(c, p)| (Arc::clone(c), p.clone()))
            .ok_or_else(|| RoutingError::ProducerNotFound(name.to_string()))
    }

    /// Every routable endpoint bound to `message_type`, in registration
    /// order. Non-routable endpoints are excluded here but stay reachable
    /// through [`find_by_name`](Self::find_by_name).
    #[must_use]
    pub fn routable_for_type(&self, message_type: &str) -> Vec<(Arc<EndpointConfiguration>, P)> {
        self.entries
            .iter()
            .filter(|(c, _)| c.is_routable() && c.message_type() == message_type)
            .map(|(c, p)| (Arc::clone(c), p.clone()))
            .collect()
    }

    /// All registered endpoints, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<EndpointConfiguration>, &P)> {
        self.entries.iter().map(|(c, p)| (c, p))
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
