use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use opentelemetry::Context;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Flat string-keyed map carrying trace context across a transport.
pub type Carrier = HashMap<String, String>;

/// Moves trace context into and out of message carriers.
///
/// A disabled bridge never adds a header or field, so traced and untraced
/// producers and consumers can share a stream.
#[derive(Clone, Default)]
pub struct TraceBridge {
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
}

impl fmt::Debug for TraceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TraceBridge {
    /// A bridge that propagates nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { propagator: None }
    }

    /// A bridge using W3C `traceparent`/`tracestate` propagation.
    #[must_use]
    pub fn w3c() -> Self {
        Self::with_propagator(TraceContextPropagator::new())
    }

    /// A bridge using the given propagator.
    #[must_use]
    pub fn with_propagator<P>(propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        Self {
            propagator: Some(Arc::new(propagator)),
        }
    }

    /// W3C propagation when `enabled`, otherwise disabled.
    #[must_use]
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled { Self::w3c() } else { Self::disabled() }
    }

    /// Whether context is propagated.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.propagator.is_some()
    }

    /// Writes `cx` into a new carrier. `None` when disabled or when there is
    /// nothing to propagate.
    #[must_use]
    pub fn inject(&self, cx: &Context) -> Option<Carrier> {
        let propagator = self.propagator.as_ref()?;

        let mut carrier = Carrier::new();
        propagator.inject_context(cx, &mut carrier);

        (!carrier.is_empty()).then_some(carrier)
    }

    /// Reads a context out of `carrier`. Empty context when disabled or when
    /// the carrier is absent.
    #[must_use]
    pub fn extract(&self, carrier: Option<&Carrier>) -> Context {
        match (&self.propagator, carrier) {
            (Some(propagator), Some(carrier)) => propagator.extract(carrier),
            _ => Context::new(),
        }
    }
}
