//! Input adapters for data entering the pipeline from outside.

pub mod json;
