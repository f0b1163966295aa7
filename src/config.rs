//! Client configuration
//!
//! Loaded from a TOML file with a `[provisioning]` and an `[mqtt]` section. Secrets
//! never live in the file: the SAS token and key passphrase are named by environment
//! variable and read when the session is built.

use crate::provisioning::topics::{validate_id_scope, validate_registration_id, IdentifierError};
use crate::provisioning::{ProvisioningSettings, RegistrationRequest, DEFAULT_GLOBAL_ENDPOINT};
use crate::transport::mqtt::{ClientCertificate, Credential};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub provisioning: ProvisioningSection,
    pub mqtt: MqttSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningSection {
    #[serde(default = "default_global_endpoint")]
    pub global_endpoint: String,
    pub id_scope: String,
    pub registration_id: String,
    /// Used when the service sends no `retry-after`
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Overall registration deadline
    pub timeout_secs: Option<u64>,
    /// Custom allocation payload, written as a TOML table
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Environment variable holding a `SharedAccessSignature ...` token
    pub sas_token_env: Option<String>,
    pub x509: Option<X509Section>,
    /// PEM bundle of trusted roots, replacing the built-in ones
    pub ca_file: Option<PathBuf>,
    /// Connect here instead of the global endpoint
    pub broker_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct X509Section {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub passphrase_env: Option<String>,
}

fn default_global_endpoint() -> String {
    DEFAULT_GLOBAL_ENDPOINT.to_string()
}

fn default_polling_interval_ms() -> u64 {
    2000
}

fn default_keep_alive_secs() -> u64 {
    180
}

fn default_clean_session() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid id scope: {0}")]
    InvalidIdScope(IdentifierError),
    #[error("Invalid registration id: {0}")]
    InvalidRegistrationId(IdentifierError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to read {path}: {source}")]
    CredentialRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ClientConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id_scope(&self.provisioning.id_scope).map_err(ConfigError::InvalidIdScope)?;
        validate_registration_id(&self.provisioning.registration_id)
            .map_err(ConfigError::InvalidRegistrationId)?;

        if self.provisioning.global_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "global_endpoint cannot be empty".to_string(),
            ));
        }
        if self.provisioning.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "polling_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.provisioning.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }

        match (&self.mqtt.sas_token_env, &self.mqtt.x509) {
            (Some(_), Some(_)) => Err(ConfigError::InvalidConfig(
                "configure either sas_token_env or [mqtt.x509], not both".to_string(),
            )),
            (None, None) => Err(ConfigError::InvalidConfig(
                "a credential is required: set sas_token_env or [mqtt.x509]".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Read the credential from the environment or the certificate files
    pub fn resolve_credential(&self) -> Result<Credential, ConfigError> {
        if let Some(env_var) = &self.mqtt.sas_token_env {
            let token = get_env_var_required(env_var)?;
            if token.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "environment variable {env_var} is empty"
                )));
            }
            return Ok(Credential::SharedAccessSignature(token));
        }

        let x509 = self.mqtt.x509.as_ref().ok_or_else(|| {
            ConfigError::InvalidConfig("no credential configured".to_string())
        })?;
        let passphrase = x509
            .passphrase_env
            .as_deref()
            .map(get_env_var_required)
            .transpose()?;
        Ok(Credential::ClientCertificate(ClientCertificate {
            certificate: read_file(&x509.cert_file)?,
            private_key: read_file(&x509.key_file)?,
            passphrase,
        }))
    }

    pub fn read_ca_certificate(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.mqtt.ca_file.as_deref().map(read_file).transpose()
    }

    /// Session settings with secrets resolved
    pub fn provisioning_settings(&self) -> Result<ProvisioningSettings, ConfigError> {
        let mut settings =
            ProvisioningSettings::new(&self.provisioning.id_scope, self.resolve_credential()?);
        settings.global_endpoint = self.provisioning.global_endpoint.clone();
        settings.broker_url = self.mqtt.broker_url.clone();
        settings.ca_certificate = self.read_ca_certificate()?;
        settings.keep_alive = Duration::from_secs(self.mqtt.keep_alive_secs);
        settings.clean_session = self.mqtt.clean_session;
        settings.polling_interval = Duration::from_millis(self.provisioning.polling_interval_ms);
        Ok(settings)
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        let request = RegistrationRequest::new(&self.provisioning.registration_id);
        match &self.provisioning.payload {
            Some(payload) => request.with_payload(payload.clone()),
            None => request,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.provisioning.timeout_secs.map(Duration::from_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[provisioning]
id_scope = "0ne00000A0A"
registration_id = "test-device"

[mqtt]
sas_token_env = "DPS_TEST_SAS_TOKEN"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::CredentialRead {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let config = ClientConfig::test_config();
        assert_eq!(config.provisioning.global_endpoint, DEFAULT_GLOBAL_ENDPOINT);
        assert_eq!(config.provisioning.polling_interval_ms, 2000);
        assert_eq!(config.provisioning.timeout_secs, None);
        assert_eq!(config.mqtt.keep_alive_secs, 180);
        assert!(config.mqtt.clean_session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_payload_table_becomes_json() {
        let toml_content = r#"
[provisioning]
id_scope = "0ne00000A0A"
registration_id = "device-1"

[provisioning.payload]
model = "thermostat"
floors = [1, 2]

[mqtt]
sas_token_env = "DPS_SAS"
"#;
        let config: ClientConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(
            config.registration_request().payload,
            Some(json!({"model": "thermostat", "floors": [1, 2]}))
        );
    }

    #[test]
    fn test_exactly_one_credential() {
        let mut config = ClientConfig::test_config();
        config.mqtt.sas_token_env = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        config.mqtt.sas_token_env = Some("DPS_SAS".to_string());
        config.mqtt.x509 = Some(X509Section {
            cert_file: PathBuf::from("device.pem"),
            key_file: PathBuf::from("device.key"),
            passphrase_env: None,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_identifier_validation() {
        let mut config = ClientConfig::test_config();
        config.provisioning.registration_id = "Bad Device".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegistrationId(_))
        ));

        let mut config = ClientConfig::test_config();
        config.provisioning.id_scope = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdScope(IdentifierError::Empty(_)))
        ));
    }

    #[test]
    fn test_missing_sas_env_var() {
        let mut config = ClientConfig::test_config();
        config.mqtt.sas_token_env = Some("DPS_MQTT_UNSET_VARIABLE_FOR_TEST".to_string());
        assert!(matches!(
            config.resolve_credential(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "DPS_MQTT_UNSET_VARIABLE_FOR_TEST"
        ));
    }

    #[test]
    fn test_settings_from_config() {
        std::env::set_var("DPS_MQTT_SETTINGS_TEST_TOKEN", "SharedAccessSignature sr=a&sig=b");
        let mut config = ClientConfig::test_config();
        config.mqtt.sas_token_env = Some("DPS_MQTT_SETTINGS_TEST_TOKEN".to_string());
        config.mqtt.broker_url = Some("mqtt://localhost:1883".to_string());
        config.provisioning.polling_interval_ms = 500;

        let settings = config.provisioning_settings().unwrap();
        assert_eq!(settings.id_scope, "0ne00000A0A");
        assert_eq!(settings.broker_uri(), "mqtt://localhost:1883");
        assert_eq!(settings.polling_interval, Duration::from_millis(500));
        assert_eq!(
            settings.credential,
            Credential::SharedAccessSignature("SharedAccessSignature sr=a&sig=b".to_string())
        );
    }
}
