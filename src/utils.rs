use std::path::Path;

use color_eyre::{eyre::WrapErr, Result};
use config::{Config as Layered, Environment, File, FileFormat};
use tracing::info;

use crate::Config;

/// Environment prefix; `CAMERA_ADAPTER__ADAPTER__COMMAND_TIMEOUT_MS=500`
/// overrides `adapter.command_timeout_ms`
pub const ENV_PREFIX: &str = "CAMERA_ADAPTER";

/// Load configuration: built-in defaults, then an optional TOML file, then
/// the environment
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = Layered::builder().add_source(
        Layered::try_from(&Config::default()).wrap_err("serializing default configuration")?,
    );
    if let Some(path) = path {
        info!(path = %path.display(), "loading configuration file");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    let layered = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .wrap_err("building configuration")?;

    layered
        .try_deserialize()
        .wrap_err("invalid camera adapter configuration")
}
