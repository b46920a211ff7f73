//! Credential discovery for the transport client.
//!
//! The vendor client library reads its service account from a well-known
//! environment variable. A `service_account_file` given in configuration is
//! exported to that variable unless the environment already names one, in
//! which case the environment wins.

use std::env;

use tracing::{debug, warn};

pub const CREDENTIALS_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Outcome of reconciling configured and ambient credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// The environment already names a credential file.
    Environment(String),
    /// Only the configuration names one; it gets exported.
    Export(String),
    /// Both are set and disagree. The environment value is used.
    Conflict { environment: String, file: String },
    /// Nothing is configured.
    Missing,
}

impl CredentialSource {
    /// The credential file the transport client will end up using.
    pub fn effective(&self) -> Option<&str> {
        match self {
            CredentialSource::Environment(path) | CredentialSource::Export(path) => Some(path),
            CredentialSource::Conflict { environment, .. } => Some(environment),
            CredentialSource::Missing => None,
        }
    }
}

pub fn resolve(file: Option<&str>, environment: Option<&str>) -> CredentialSource {
    let file = file.filter(|f| !f.is_empty());
    let environment = environment.filter(|e| !e.is_empty());

    match (file, environment) {
        (None, None) => CredentialSource::Missing,
        (Some(file), None) => CredentialSource::Export(file.to_string()),
        (None, Some(env_path)) => CredentialSource::Environment(env_path.to_string()),
        (Some(file), Some(env_path)) if file == env_path => {
            CredentialSource::Environment(env_path.to_string())
        }
        (Some(file), Some(env_path)) => CredentialSource::Conflict {
            environment: env_path.to_string(),
            file: file.to_string(),
        },
    }
}

/// Resolve against the process environment, export when needed and log
/// anything suspicious.
pub fn apply(file: Option<&str>) -> CredentialSource {
    let ambient = env::var(CREDENTIALS_ENV_VAR).ok();
    let source = resolve(file, ambient.as_deref());

    match &source {
        CredentialSource::Missing => {
            warn!(
                "No service account specified and {CREDENTIALS_ENV_VAR} env var is not set. \
                 You may not be able to authenticate to the transport"
            );
        }
        CredentialSource::Export(path) => {
            debug!(path = %path, "Exporting service account file to {CREDENTIALS_ENV_VAR}");
            // SAFETY: callers must run this before other threads read the
            // process environment, i.e. while activating the brew and before
            // a multi-threaded runtime starts its workers. Hosts that cannot
            // promise that pass `CredentialSource::effective` to their client
            // builder instead of relying on the variable.
            unsafe { env::set_var(CREDENTIALS_ENV_VAR, path) };
        }
        CredentialSource::Conflict { environment, file } => {
            warn!(
                configured = %file,
                environment = %environment,
                "Configured service account differs from {CREDENTIALS_ENV_VAR}; using the environment value"
            );
        }
        CredentialSource::Environment(path) => {
            debug!(path = %path, "Using service account from {CREDENTIALS_ENV_VAR}");
        }
    }

    source
}
