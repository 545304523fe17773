//! Command surface exposed to the presentation layer.
//!
//! Versioned modules (currently `v1`) group related commands so the
//! interface stays stable while the engine evolves.

pub mod v1;
