//! Domain layer: message schemas, delivery envelopes, queue topology and the
//! ports the pipeline depends on.

pub mod envelope;
pub mod order;
pub mod ports;
pub mod queue;
