use serde::Deserialize;

/// Top-level configuration settings for the bus.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub dlq: DlqSettings,
    pub persistence: PersistenceSettings,
    pub bus: BusSettings,
    pub logging: LoggingSettings,
}

/// Queue sizing and flow control for the in-memory broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_queue_size: usize,
    pub backpressure_threshold: f64,
    pub backpressure_delay_ms: u64,
    pub idle_poll_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DlqSettings {
    pub enabled: bool,
    pub max_size: usize,
    pub max_retries: u32,
}

/// Sled-backed message store. Off unless enabled.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub path: String,
    pub max_messages_per_topic: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    pub request_timeout_ms: u64,
    pub auto_inject_trace: bool,
    pub sender: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub dlq: Option<PartialDlqSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub bus: Option<PartialBusSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_queue_size: Option<usize>,
    pub backpressure_threshold: Option<f64>,
    pub backpressure_delay_ms: Option<u64>,
    pub idle_poll_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDlqSettings {
    pub enabled: Option<bool>,
    pub max_size: Option<usize>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
    pub max_messages_per_topic: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBusSettings {
    pub request_timeout_ms: Option<u64>,
    pub auto_inject_trace: Option<bool>,
    pub sender: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                max_queue_size: 10_000,
                backpressure_threshold: 0.8,
                backpressure_delay_ms: 10,
                idle_poll_ms: 10,
            },
            dlq: DlqSettings {
                enabled: true,
                max_size: 10_000,
                max_retries: 3,
            },
            persistence: PersistenceSettings {
                enabled: false,
                path: "agentbus_db".to_string(),
                max_messages_per_topic: None,
            },
            bus: BusSettings {
                request_timeout_ms: 30_000,
                auto_inject_trace: true,
                sender: None,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with the default.
    pub fn merged(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let broker = partial.broker.unwrap_or_default();
        let dlq = partial.dlq.unwrap_or_default();
        let persistence = partial.persistence.unwrap_or_default();
        let bus = partial.bus.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                max_queue_size: broker.max_queue_size.unwrap_or(default.broker.max_queue_size),
                backpressure_threshold: broker
                    .backpressure_threshold
                    .unwrap_or(default.broker.backpressure_threshold),
                backpressure_delay_ms: broker
                    .backpressure_delay_ms
                    .unwrap_or(default.broker.backpressure_delay_ms),
                idle_poll_ms: broker.idle_poll_ms.unwrap_or(default.broker.idle_poll_ms),
            },
            dlq: DlqSettings {
                enabled: dlq.enabled.unwrap_or(default.dlq.enabled),
                max_size: dlq.max_size.unwrap_or(default.dlq.max_size),
                max_retries: dlq.max_retries.unwrap_or(default.dlq.max_retries),
            },
            persistence: PersistenceSettings {
                enabled: persistence.enabled.unwrap_or(default.persistence.enabled),
                path: persistence.path.unwrap_or(default.persistence.path),
                max_messages_per_topic: persistence
                    .max_messages_per_topic
                    .or(default.persistence.max_messages_per_topic),
            },
            bus: BusSettings {
                request_timeout_ms: bus
                    .request_timeout_ms
                    .unwrap_or(default.bus.request_timeout_ms),
                auto_inject_trace: bus
                    .auto_inject_trace
                    .unwrap_or(default.bus.auto_inject_trace),
                sender: bus.sender.or(default.bus.sender),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
