//! Component implementations.
//!
//! Concrete sources and destinations built on the ingestion core.

#![deny(warnings)]
#![deny(missing_docs)]

pub mod destinations;
pub mod sources;
