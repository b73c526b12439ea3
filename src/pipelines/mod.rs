//! # Pipelines Module
//!
//! High-level workflow orchestration for the three run modes: imputation,
//! reference compression, and legacy format conversion.

pub mod compress;
pub mod convert;
pub mod imputation;
