//! Layered configuration for Harbor components.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Serialized, Toml},
    Figment, Provider,
};
use harbor_error::GenericError;
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read or parsed.
    #[snafu(display("Failed to load configuration file '{}': {}", path, source))]
    InvalidFile {
        /// Path to the file.
        path: String,

        /// Error source.
        source: GenericError,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field, including any environment variable spelling.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's value did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration: {}", source))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is stored uppercased with its trailing underscore already attached.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

/// A configuration loader that merges values from several sources.
///
/// Sources are merged in the order they are added, with later sources taking precedence over earlier ones. Once all
/// sources are added, the loader is converted into a [`GenericConfiguration`] ([`into_generic`][Self::into_generic])
/// or deserialized directly ([`into_typed`][Self::into_typed]).
///
/// # Supported sources
///
/// - TOML file, or TOML string
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    figment: Figment,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            lookup_sources: HashSet::new(),
            figment: Figment::new(),
        }
    }
}

impl ConfigurationLoader {
    /// Loads the given TOML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid TOML, an error will be returned.
    pub fn from_toml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let provider = resolve_toml_file(path).map_err(|source| ConfigurationError::InvalidFile {
            path: path.to_string_lossy().into_owned(),
            source,
        })?;

        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Attempts to load the given TOML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being valid TOML.
    pub fn try_from_toml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let fallback = Self {
            lookup_sources: self.lookup_sources.clone(),
            figment: self.figment.clone(),
        };

        match self.from_toml(&path) {
            Ok(loader) => loader,
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to read TOML configuration file. Ignoring.");
                fallback
            }
        }
    }

    /// Loads configuration from an inline TOML document.
    pub fn from_toml_str(mut self, contents: &str) -> Self {
        self.figment = self.figment.admerge(Toml::string(contents));
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with
    /// a prefix of `harbor`, any environment variable starting with `HARBOR_` would be matched. The prefix is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // Snapshot the environment now so the resulting configuration is stable for the life of the process.
        let values = Env::prefixed(&prefix)
            .data()
            .map_err(|e| ConfigurationError::Generic { source: e.into() })?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.figment = self.figment.admerge(Serialized::defaults(default_dict.clone()));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }

        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.figment
            .extract()
            .map_err(|e| from_figment_error(&self.lookup_sources, e))
    }

    /// Consumes the configuration loader and wraps it in a generic wrapper.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

/// Reads and parses a TOML file up front, so that I/O and syntax errors surface at load time rather than on first
/// query.
fn resolve_toml_file(path: &Path) -> Result<Serialized<figment::value::Dict>, GenericError> {
    let contents = std::fs::read_to_string(path)?;
    let values = Toml::string(&contents).data()?;
    let dict = values.get(&figment::Profile::Default).cloned().unwrap_or_default();
    if dict.is_empty() {
        debug!(file_path = %path.display(), "Configuration file contained no values.");
    }

    Ok(Serialized::defaults(dict))
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// A generic configuration object.
///
/// This represents the merged configuration derived from [`ConfigurationLoader`] in its raw form. Values can be
/// queried by key, either for a single value or for an entire section, and extracted as typed values.
///
/// Keys must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested value. Given the TOML
/// document:
///
/// ```toml
/// [http_push]
/// path = "/write"
/// ```
///
/// querying for `http_push.path` returns `"/write"`, and querying for `http_push` returns the whole table.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    // Environment variables can't express nesting with periods, so `http_push.path` may only exist as
                    // the flattened key `http_push_path`. Retry with the flattened spelling before giving up.
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(from_figment_error(&self.inner.lookup_sources, e))
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// variant will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if the key does not exist or could not be
    /// deserialized.
    ///
    /// This swallows deserialization errors and should be used sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the value exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }

    /// Returns `true` if the given key is present in the configuration.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.figment.contains(key) || self.inner.figment.contains(&key.replace('.', "_"))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();

            // Always list the original key first.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
