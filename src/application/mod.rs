//! Application layer: the stage handlers, the router that drives them from
//! their queues, and the producer that feeds the first queue.

pub mod handlers;
pub mod producer;
pub mod router;
