use std::time::Duration;

/// Default timeout for a correlated command call.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of one [`EventBusClient`](crate::EventBusClient) instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name stamped on outgoing commands and events.
    pub service_name: String,

    /// Consumer group id. Defaults to the service name.
    pub group_id: Option<String>,

    /// Timeout used when the caller does not pass one.
    pub default_timeout: Duration,

    /// How many times the reply listener is resubscribed before the client
    /// is marked unhealthy.
    pub listener_max_restarts: u32,

    /// Pause before each listener resubscription.
    pub listener_restart_backoff: Duration,
}

impl BusConfig {
    /// Creates a configuration with defaults for `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            group_id: None,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            listener_max_restarts: 5,
            listener_restart_backoff: Duration::from_millis(100),
        }
    }

    /// Sets the consumer group id.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Sets the default command timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the listener restart budget and backoff.
    pub fn with_listener_restarts(mut self, max_restarts: u32, backoff: Duration) -> Self {
        self.listener_max_restarts = max_restarts;
        self.listener_restart_backoff = backoff;
        self
    }

    /// Returns the effective consumer group id.
    pub fn group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.service_name)
    }
}

impl Default for BusConfig {
    /// Configuration of the saga coordinator's client.
    fn default() -> Self {
        Self::new(crate::COORDINATOR_SERVICE)
    }
}
