mod settings;
pub mod credentials;

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};

use settings::{PartialPubSubSettings, PartialSettings};

pub use credentials::CredentialSource;
pub use settings::{LoggingSettings, PubSubSettings, Settings};

/// The string mapping the host hands to `configure`.
pub type BrewContext = HashMap<String, String>;

/// Loads the configuration from the optional `config/brew` file and
/// `BREW_`-prefixed environment variables (`BREW_PUBSUB__PROJECT_ID`,
/// `BREW_LOGGING__LEVEL`), merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/brew").required(false))
        .add_source(
            Environment::with_prefix("BREW")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

/// Reads the transport settings out of a host configuration mapping.
///
/// Keys may be snake case (`project_id`), camel case (`projectId`) or upper
/// case (`PROJECT_ID`); `gcp_project` is accepted for the project too.
/// Unknown keys are ignored and missing ones fall back to `defaults`, so a
/// host that only passes a project still gets a usable result.
pub fn from_context(
    context: &BrewContext,
    defaults: PubSubSettings,
) -> Result<PubSubSettings, ConfigError> {
    let mut builder = Config::builder();
    for (key, value) in context {
        builder = builder.set_override(context_key(key), value.as_str())?;
    }

    let partial: PartialPubSubSettings = builder.build()?.try_deserialize()?;
    Ok(partial.merge(defaults))
}

/// `projectId` -> `project_id`, `PROJECT_ID` -> `project_id`.
fn context_key(key: &str) -> String {
    let key = key.trim();
    if !key.chars().any(|c| c.is_ascii_lowercase()) {
        return key.to_ascii_lowercase();
    }

    let mut normalized = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !normalized.ends_with('_') {
                normalized.push('_');
            }
            normalized.push(c.to_ascii_lowercase());
        } else {
            normalized.push(c);
        }
    }
    normalized
}
