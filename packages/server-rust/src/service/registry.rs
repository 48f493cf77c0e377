use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rpcweb_core::{
    MultiplexedProcessor, Processor, ProtocolKind, ServiceDefinition, ServiceHandler,
    TransportKind,
};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Registration options
// ---------------------------------------------------------------------------

/// The ways a route's processor can be supplied.
#[derive(Clone)]
pub enum ProcessorSource {
    /// Pre-built multiplexed processor with its handlers already embedded.
    Multiplexed(Arc<MultiplexedProcessor>),
    /// Processor already bound to its handler.
    Instance(Arc<dyn Processor>),
    /// Method table that still needs a handler.
    Definition(Arc<ServiceDefinition>),
}

impl fmt::Debug for ProcessorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multiplexed(p) => f.debug_tuple("Multiplexed").field(p).finish(),
            Self::Instance(_) => f.write_str("Instance"),
            Self::Definition(d) => f.debug_tuple("Definition").field(&d.name()).finish(),
        }
    }
}

/// Loosely-typed registration record for one route.
///
/// `cls` is the older spelling of `processor` and is only consulted when
/// `processor` is absent.
#[derive(Clone, Default)]
pub struct ServiceOptions {
    pub processor: Option<ProcessorSource>,
    pub cls: Option<ProcessorSource>,
    pub handler: Option<Arc<dyn ServiceHandler>>,
    pub transport: Option<TransportKind>,
    pub protocol: Option<ProtocolKind>,
}

impl fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("processor", &self.processor)
            .field("cls", &self.cls)
            .field("handler", &self.handler.is_some())
            .field("transport", &self.transport)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl ServiceOptions {
    #[must_use]
    pub fn multiplexed(processor: MultiplexedProcessor) -> Self {
        Self {
            processor: Some(ProcessorSource::Multiplexed(Arc::new(processor))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn instance(processor: impl Processor + 'static) -> Self {
        Self {
            processor: Some(ProcessorSource::Instance(Arc::new(processor))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn definition(definition: ServiceDefinition, handler: impl ServiceHandler + 'static) -> Self {
        Self {
            processor: Some(ProcessorSource::Definition(Arc::new(definition))),
            handler: Some(Arc::new(handler)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

// ---------------------------------------------------------------------------
// ServiceRecord
// ---------------------------------------------------------------------------

/// Canonical, immutable description of one route.
#[derive(Clone)]
pub struct ServiceRecord {
    pub processor: Arc<dyn Processor>,
    pub transport: TransportKind,
    pub protocol: ProtocolKind,
}

impl fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("transport", &self.transport)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Rejected registration, reported once at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("route {route:?} has no processor")]
    MissingProcessor { route: String },
    #[error("route {route:?}: service {service:?} needs a handler")]
    MissingHandler { route: String, service: String },
    #[error("route {route:?}: a handler cannot be bound to an already-bound processor")]
    HandlerOnInstance { route: String },
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Route table built once from [`ServiceOptions`]; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    routes: HashMap<String, Arc<ServiceRecord>>,
}

impl ServiceRegistry {
    /// Normalizes every route's options into a [`ServiceRecord`].
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistryError`] encountered.
    pub fn from_options<I, R>(options: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (R, ServiceOptions)>,
        R: Into<String>,
    {
        let mut routes = HashMap::new();
        for (route, opts) in options {
            let route = route.into();
            let record = normalize(&route, opts)?;
            debug!(%route, transport = ?record.transport, protocol = ?record.protocol, "service registered");
            routes.insert(route, Arc::new(record));
        }
        Ok(Self { routes })
    }

    /// Looks up the record for `route`.
    #[must_use]
    pub fn get(&self, route: &str) -> Option<Arc<ServiceRecord>> {
        self.routes.get(route).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered routes, in no particular order.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

/// Resolves one route's options into its canonical record.
///
/// # Errors
///
/// See [`RegistryError`].
pub fn normalize(route: &str, options: ServiceOptions) -> Result<ServiceRecord, RegistryError> {
    let ServiceOptions {
        processor,
        cls,
        handler,
        transport,
        protocol,
    } = options;

    let source = processor.or(cls).ok_or_else(|| RegistryError::MissingProcessor {
        route: route.to_string(),
    })?;

    let processor: Arc<dyn Processor> = match (source, handler) {
        (ProcessorSource::Multiplexed(mux), handler) => {
            if handler.is_some() {
                warn!(%route, "handler ignored for multiplexed processor");
            }
            mux
        }
        (ProcessorSource::Instance(_), Some(_)) => {
            return Err(RegistryError::HandlerOnInstance {
                route: route.to_string(),
            })
        }
        (ProcessorSource::Instance(instance), None) => instance,
        (ProcessorSource::Definition(definition), Some(handler)) => Arc::new(definition.bind(handler)),
        (ProcessorSource::Definition(definition), None) => {
            return Err(RegistryError::MissingHandler {
                route: route.to_string(),
                service: definition.name().to_string(),
            })
        }
    };

    Ok(ServiceRecord {
        processor,
        transport: transport.unwrap_or_default(),
        protocol: protocol.unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
