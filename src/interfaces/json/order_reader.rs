use crate::domain::order::Order;
use crate::error::{PipelineError, Result};
use std::io::Read;

/// Reads orders from a stream of whitespace-separated JSON objects
/// (one per line, typically).
pub struct OrderReader<R: Read> {
    source: R,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Lazily deserializes orders; a bad record yields an error item.
    pub fn orders(self) -> impl Iterator<Item = Result<Order>> {
        serde_json::Deserializer::from_reader(self.source)
            .into_iter::<Order>()
            .map(|result| result.map_err(PipelineError::from))
    }
}
