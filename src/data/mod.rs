//! Database operations. Every SQL statement the runtime issues lives in
//! this module tree.

pub mod jobs;
pub mod producers;
