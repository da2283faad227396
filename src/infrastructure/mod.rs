//! Adapters behind the domain ports: the in-process broker with its disk
//! spool, and the payment gateways.

pub mod in_memory;
pub mod payment;
pub mod spool;
