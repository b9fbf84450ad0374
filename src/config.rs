use serde::Deserialize;

/// Capacity limits applied to every ingested record. All limits are
/// per-repository; `max_attribute_length` is measured in UTF-16 code units
/// to match what OTLP-emitting SDKs count.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryLimitOptions {
    /// Size of the global log ring buffer.
    pub max_log_count: usize,
    /// Maximum number of traces retained before FIFO eviction.
    pub max_trace_count: usize,
    /// Data points retained per metric dimension.
    pub max_metrics_count: usize,
    /// Attributes retained per record.
    pub max_attribute_count: usize,
    /// Attribute value length cap, in UTF-16 code units.
    pub max_attribute_length: usize,
    /// Events retained per span.
    pub max_span_event_count: usize,
}

impl Default for TelemetryLimitOptions {
    fn default() -> Self {
        Self {
            max_log_count: 10_000,
            max_trace_count: 10_000,
            max_metrics_count: 30_000,
            max_attribute_count: 128,
            max_attribute_length: usize::MAX,
            max_span_event_count: 128,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("limit option `{0}` must be greater than zero")]
    ZeroLimit(&'static str),
}

impl TelemetryLimitOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_log_count == 0 {
            return Err(ConfigError::ZeroLimit("max_log_count"));
        }
        if self.max_trace_count == 0 {
            return Err(ConfigError::ZeroLimit("max_trace_count"));
        }
        if self.max_metrics_count == 0 {
            return Err(ConfigError::ZeroLimit("max_metrics_count"));
        }
        if self.max_attribute_count == 0 {
            return Err(ConfigError::ZeroLimit("max_attribute_count"));
        }
        if self.max_attribute_length == 0 {
            return Err(ConfigError::ZeroLimit("max_attribute_length"));
        }
        if self.max_span_event_count == 0 {
            return Err(ConfigError::ZeroLimit("max_span_event_count"));
        }
        Ok(())
    }
}
