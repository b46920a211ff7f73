use serde::{Deserialize, Serialize};

/// Top-level configuration settings for the brew.
///
/// Includes the transport connection settings and the logging level used by
/// the binary.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub pubsub: PubSubSettings,
    pub logging: LoggingSettings,
}

/// Connection settings for the external pub/sub transport.
///
/// Both values are optional at load time. A missing `project_id` only becomes
/// an error once a brewer or patron needs a resource path.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct PubSubSettings {
    pub project_id: Option<String>,
    pub service_account_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub pubsub: Option<PartialPubSubSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPubSubSettings {
    #[serde(alias = "gcp_project", alias = "projectid")]
    pub project_id: Option<String>,
    #[serde(alias = "serviceaccountfile")]
    pub service_account_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pubsub: PubSubSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialPubSubSettings {
    /// Fill the gaps from `default`. Blank strings count as unset.
    pub fn merge(self, default: PubSubSettings) -> PubSubSettings {
        PubSubSettings {
            project_id: non_blank(self.project_id).or(default.project_id),
            service_account_file: non_blank(self.service_account_file)
                .or(default.service_account_file),
        }
    }
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            pubsub: self.pubsub.unwrap_or_default().merge(default.pubsub),
            logging: LoggingSettings {
                level: self
                    .logging
                    .and_then(|l| non_blank(l.level))
                    .unwrap_or(default.logging.level),
            },
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
