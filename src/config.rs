use std::time::Duration;

/// Runtime knobs for the consumer side of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Unacknowledged deliveries allowed per consumer.
    pub prefetch: u16,
    /// Deliveries a malformed message gets before it is dead-lettered.
    /// `None` keeps requeueing it forever.
    pub max_deliveries: Option<u32>,
    pub validation_latency: Duration,
    pub payment_latency: Duration,
    pub payment_success_rate: f64,
    pub payment_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_deliveries: Some(5),
            validation_latency: Duration::from_secs(1),
            payment_latency: Duration::from_secs(2),
            payment_success_rate: 0.9,
            payment_seed: None,
        }
    }
}

impl PipelineConfig {
    /// Zero latencies and the given payment outcome rate, for fast runs.
    pub fn immediate(payment_success_rate: f64) -> Self {
        Self {
            validation_latency: Duration::ZERO,
            payment_latency: Duration::ZERO,
            payment_success_rate,
            ..Self::default()
        }
    }
}
