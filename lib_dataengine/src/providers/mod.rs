//! # Built-in Providers
//!
//! Ready-made `SourceProvider` implementations that binaries can register in
//! a `ProviderCatalog` without writing their own.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Wall clock sources per time zone.
pub mod clock;

pub use clock::{ClockProvider, LOCAL_SOURCE, UTC_SOURCE};
