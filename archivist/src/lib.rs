//! Performance archive ingestion.
//!
//! archivist takes compressed performance archive bundles, works out which of
//! the archive's metrics produce numeric series, streams those series out of
//! the archive and writes them as batched points into InfluxDB. Metric
//! discovery and sampling are done by external tools run as sub-processes;
//! this library orchestrates them, one archive at a time.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod convert;
pub mod extract;
pub mod lifecycle;
pub mod locator;
pub mod runner;
pub mod schedule;
pub mod tracker;
pub mod writer;
