//! Platform coprocessor drivers
//!
//! Vendor drivers plug into the core through [`crate::coproc::CoprocDriver`]
//! and register themselves in the probe match table handed to
//! [`crate::coproc::coproc_init`]. The template driver is the starting
//! point a vendor copies; it also backs the integration tests.

pub mod template;
