//! # Model Module
//!
//! The Li-Stephens hidden Markov model and its dosage result storage.

pub mod dosage;
pub mod hmm;
