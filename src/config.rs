//! # Configuration
//!
//! Trace propagation is configured explicitly, at construction time: layers and tracers are
//! built from a [`TraceSettings`] value instead of being switched on by a process-wide side
//! effect.
//!
//! Settings are loaded with [figment](https://docs.rs/figment), from lowest to highest
//! precedence:
//!
//! 1. The defaults of the settings type
//! 2. A TOML file
//! 3. Environment variables with a prefix, `__` separating nested keys
//!    (`MYAPP_TRACING__SAMPLED=true` overrides `tracing.sampled`)
//!
//! Documented sample files are generated with [doku](https://docs.rs/doku).

use std::path::{Path, PathBuf};

use doku::Document;
use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ensure, ResultExt as _};

use crate::telemetry::TelemetrySettings;
use crate::{ConfigFileMissingSnafu, ConfigFileWriteSnafu, ConfigLoadSnafu, Error};

/// Trace propagation settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct TraceSettings {
    /// Send trace headers on outgoing calls made under a traced context
    #[doku(example = "true")]
    pub client_enabled: bool,

    /// Rebuild spans from the trace headers of incoming calls
    #[doku(example = "true")]
    pub server_enabled: bool,

    /// Sample (and report) traces started by this process
    #[doku(example = "false")]
    pub sampled: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            client_enabled: true,
            server_enabled: true,
            sampled: false,
        }
    }
}

/// Complete settings of a traced service.
#[derive(Debug, Default, Serialize, Deserialize, Document)]
#[serde(default)]
pub struct Settings {
    /// Trace propagation settings
    pub tracing: TraceSettings,

    /// Telemetry settings
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Loads [`Settings`]; see [`load`].
    ///
    /// # Errors
    /// - `ConfigFileMissing` if `config_path` is not a file.
    /// - `ConfigLoad` if the file cannot be parsed or a value has the wrong type.
    pub fn load<P, E>(config_path: Option<P>, env_prefix: Option<E>) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        E: AsRef<str>,
    {
        load(config_path, env_prefix)
    }
}

/// Loads a settings type from its defaults, an optional TOML file and optional prefixed
/// environment variables.
///
/// Services usually embed [`TraceSettings`] in their own settings type and load that.
///
/// # Errors
/// - `ConfigFileMissing` if `config_path` is not a file.
/// - `ConfigLoad` if the file cannot be parsed or a value has the wrong type.
pub fn load<C, P, E>(config_path: Option<P>, env_prefix: Option<E>) -> Result<C, Error>
where
    C: Default + Serialize + DeserializeOwned,
    P: AsRef<Path>,
    E: AsRef<str>,
{
    let figment = Figment::from(Serialized::defaults(C::default()));

    let figment = match config_path {
        Some(path) => {
            let path = path.as_ref();
            ensure!(path.is_file(), ConfigFileMissingSnafu { path });
            figment.merge(Toml::file(path))
        }
        None => figment,
    };

    let figment = match env_prefix {
        Some(prefix) => figment.merge(Env::prefixed(prefix.as_ref()).split("__")),
        None => figment,
    };

    figment.extract().map_err(Box::new).context(ConfigLoadSnafu)
}

/// Writes a documented sample configuration for `C` to `config_path`.
///
/// # Errors
/// - `ConfigFileWrite` if the file cannot be written.
pub fn create_config_file<C>(config_path: impl Into<PathBuf>) -> Result<(), Error>
where
    C: Document,
{
    let path = config_path.into();
    let contents = doku::to_toml::<C>();
    std::fs::write(&path, contents).context(ConfigFileWriteSnafu { path })?;
    Ok(())
}
