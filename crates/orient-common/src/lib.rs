//! Common types shared across the orientation stream tools.
//!
//! This crate provides:
//! - Orientation frame decoding and normalization ([`sample`])
//! - Protocol constants and close codes ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sample;
pub mod types;

pub use sample::{decode, DecodeError, OrientationDecoder, OrientationSample};
