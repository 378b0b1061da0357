//! Scan relay library
//!
//! Sequential barcode validation: scans arriving on serial inputs are
//! checked against an ordered master sequence and drive relay pulses on a
//! serial output. Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
