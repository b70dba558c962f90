//! Payload codecs: content decoding, line protocol, and JSON.
#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use harbor_core::ingest::Parser;
use serde::Deserialize;

pub mod decode;
pub mod json;
pub mod line_protocol;

use self::{
    json::{JsonConfiguration, JsonParser},
    line_protocol::{LineProtocolParser, Precision},
};

/// Payload data formats.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Line protocol.
    #[default]
    LineProtocol,

    /// JSON objects, or arrays of objects.
    Json,
}

/// Parser configuration.
///
/// Meant to be flattened into a source's configuration, so that `data_format` and the format-specific options sit next
/// to the rest of the source settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ParserConfiguration {
    /// Format of decoded payloads.
    ///
    /// Defaults to line protocol.
    #[serde(default)]
    pub data_format: DataFormat,

    /// Unit of line protocol timestamps.
    ///
    /// Defaults to nanoseconds.
    #[serde(default)]
    pub precision: Precision,

    /// Options for the JSON format.
    #[serde(flatten)]
    pub json: JsonConfiguration,
}

impl ParserConfiguration {
    /// Builds the parser for the configured data format.
    pub fn build(&self) -> Arc<dyn Parser> {
        match self.data_format {
            DataFormat::LineProtocol => Arc::new(LineProtocolParser::new().with_precision(self.precision)),
            DataFormat::Json => Arc::new(JsonParser::new(self.json.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use harbor_core::data_model::FieldValue;

    use super::*;

    #[test]
    fn builds_configured_parser() {
        let config: ParserConfiguration =
            serde_json::from_str(r#"{"data_format": "json", "json_name_key": "name"}"#).unwrap();
        let metrics = config.build().parse(br#"{"name": "mem", "used": 3}"#).unwrap();
        assert_eq!(metrics[0].name(), "mem");

        let config = ParserConfiguration::default();
        let metrics = config.build().parse(b"mem used=3i").unwrap();
        assert_eq!(metrics[0].fields().get("used"), Some(&FieldValue::Integer(3)));
    }
}
