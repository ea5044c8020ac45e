use super::{BatchHandler, ConfigError, ErrorSink};
use crate::domain::{EventType, HandlerErrorPolicy, MemberId, OffsetStoreKind};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

/// Settings of a [`Consumer`](super::Consumer)
///
/// Created through [`ConsumerConfig::builder`] which validates the values.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Logical group identity shared by every cooperating process
    pub consumer_name: String,
    /// Handler for each consumed event type
    pub handlers: HashMap<EventType, Arc<dyn BatchHandler>>,
    /// Time between two partition discovery runs
    pub discovery_interval: Duration,
    /// Time after which the session of an unresponsive member ends
    pub session_timeout: Duration,
    /// Upper bound for individual coordination store operations
    pub operation_timeout: Duration,
    /// Grace period for workers to finish their current batch on shutdown
    pub drain_timeout: Duration,
    /// Reaction to batches that fail to decode or process
    pub handler_error_policy: HandlerErrorPolicy,
    /// Backend for committed cursors
    pub offset_store: OffsetStoreKind,
    /// Number of handlers that may run concurrently across all partitions
    pub max_parallel_handlers: usize,
    /// Fixed member identifier instead of a generated one
    pub member_id: Option<MemberId>,
    /// Receiver of decode and handler failures, logs them by default
    pub error_sink: Option<Arc<dyn ErrorSink>>,
}

impl ConsumerConfig {
    /// Starts building a configuration for the given consumer name
    pub fn builder(consumer_name: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            config: ConsumerConfig {
                consumer_name: consumer_name.into(),
                handlers: HashMap::new(),
                discovery_interval: Duration::from_secs(30),
                session_timeout: Duration::from_secs(10),
                operation_timeout: Duration::from_secs(5),
                drain_timeout: Duration::from_secs(1),
                handler_error_policy: HandlerErrorPolicy::default(),
                offset_store: OffsetStoreKind::default(),
                max_parallel_handlers: 16,
                member_id: None,
                error_sink: None,
            },
        }
    }

    /// Every configured event type, sorted
    pub fn event_types(&self) -> Vec<EventType> {
        let mut event_types: Vec<EventType> = self.handlers.keys().cloned().collect();
        event_types.sort();
        event_types
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer_name.is_empty() {
            return Err(ConfigError::EmptyConsumerName);
        }

        validate_segment(&self.consumer_name)?;

        if self.handlers.is_empty() {
            return Err(ConfigError::NoHandlers);
        }

        for event_type in self.handlers.keys() {
            validate_segment(event_type.as_str())?;
        }

        if let Some(member_id) = &self.member_id {
            validate_segment(member_id.as_str())?;
        }

        let durations = [
            ("discovery_interval", self.discovery_interval),
            ("session_timeout", self.session_timeout),
            ("operation_timeout", self.operation_timeout),
            ("drain_timeout", self.drain_timeout),
        ];

        if let Some((name, _)) = durations.iter().find(|(_, duration)| duration.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }

        if self.max_parallel_handlers == 0 {
            return Err(ConfigError::NoHandlerCapacity);
        }

        Ok(())
    }
}

fn validate_segment(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains('/') {
        Err(ConfigError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("consumer_name", &self.consumer_name)
            .field("event_types", &self.event_types())
            .field("discovery_interval", &self.discovery_interval)
            .field("session_timeout", &self.session_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("handler_error_policy", &self.handler_error_policy)
            .field("offset_store", &self.offset_store)
            .field("max_parallel_handlers", &self.max_parallel_handlers)
            .field("member_id", &self.member_id)
            .finish()
    }
}

/// Builder for [`ConsumerConfig`]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Registers the handler for an event type, replacing any previous one
    pub fn handler(mut self, event_type: impl Into<EventType>, handler: impl BatchHandler + 'static) -> Self {
        self.config
            .handlers
            .insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Registers an already shared handler for an event type
    pub fn shared_handler(mut self, event_type: impl Into<EventType>, handler: Arc<dyn BatchHandler>) -> Self {
        self.config.handlers.insert(event_type.into(), handler);
        self
    }

    /// Time between two partition discovery runs
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.config.discovery_interval = interval;
        self
    }

    /// Time after which the session of an unresponsive member ends
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Upper bound for individual coordination store operations
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Grace period for workers on shutdown
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Reaction to failing batches
    pub fn handler_error_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.config.handler_error_policy = policy;
        self
    }

    /// Backend for committed cursors
    pub fn offset_store(mut self, kind: OffsetStoreKind) -> Self {
        self.config.offset_store = kind;
        self
    }

    /// Number of handlers that may run concurrently
    pub fn max_parallel_handlers(mut self, count: usize) -> Self {
        self.config.max_parallel_handlers = count;
        self
    }

    /// Fixed member identifier
    pub fn member_id(mut self, member_id: impl Into<MemberId>) -> Self {
        self.config.member_id = Some(member_id.into());
        self
    }

    /// Receiver of decode and handler failures
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.config.error_sink = Some(sink);
        self
    }

    /// Validates and returns the configuration
    pub fn build(self) -> Result<ConsumerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
