//! Destination implementations.

mod line_writer;
pub use self::line_writer::{LineWriter, LineWriterConfiguration};
