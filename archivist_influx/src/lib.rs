//! Crate regarding archivist's writes into InfluxDB
//!
//! Points are encoded to line protocol ([`point`]), shipped over HTTP by
//! [`client::Client`] and batched in the background by [`write::WriteApi`].
//! Callers hand points to the write API and never wait on the network except
//! at an explicit flush.

#![deny(clippy::all)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

pub mod client;
pub mod point;
pub mod write;

pub use client::Client;
pub use point::Point;
pub use write::WriteApi;
