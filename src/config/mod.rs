mod settings;

use config::{Config, Environment, File};

pub use settings::{
    BrokerSettings, BusSettings, DlqSettings, LoggingSettings, PartialSettings,
    PersistenceSettings, Settings,
};

use crate::utils::Result;

/// Environment variables starting with this prefix override file values,
/// e.g. `AGENTBUS__BROKER__MAX_QUEUE_SIZE=500`.
pub const ENV_PREFIX: &str = "AGENTBUS";

/// Loads the configuration from the optional `config/default` file and
/// `AGENTBUS__*` environment variables, then fills the gaps with defaults.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merged(partial))
}
