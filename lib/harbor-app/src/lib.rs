//! Process-level scaffolding shared by Harbor binaries.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;
