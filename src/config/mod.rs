//! Configuration loading.
//!
//! Sources, later ones winning: built-in defaults, `config/default.toml`
//! (optional), then `TOPICBUS__<SECTION>__<KEY>` environment variables. A
//! `.env` file in the working directory is loaded into the environment first.

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConsumerSettings, OutboxSettings, PartialSettings, PublisherSettings,
    ReconnectSettings, ServiceSettings, Settings,
};

/// Loads the configuration from the default file and environment variables,
/// merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("TOPICBUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
