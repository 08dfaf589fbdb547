use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stek_core::{
    CipherAlgorithm, Clock, DigestAlgorithm, InMemoryKeyStore, KeyFile, RandomSource,
    ReseedingEntropy, RotationPolicy, SystemClock,
};
use tracing::info;

use crate::dispatcher::TicketKeyDispatcher;
use crate::error::TicketError;
use crate::negotiator::TicketNegotiator;
use crate::policy::RenewalPolicy;

/// Session ticket settings as they appear in a server config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    pub enabled: bool,
    pub key_lifetime_secs: u64,
    pub rotate_before_expiry_secs: u64,
    /// Zero disables renewal.
    pub renewal_threshold_secs: u64,
    /// Defaults to AES-256-GCM on CPUs with AES instructions, ChaCha20-Poly1305 otherwise.
    pub cipher: Option<CipherAlgorithm>,
    pub digest: DigestAlgorithm,
    /// JSON key file to seed the store with. Keys are minted in memory when absent.
    pub key_file: Option<PathBuf>,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_lifetime_secs: 12 * 60 * 60,
            rotate_before_expiry_secs: 60 * 60,
            renewal_threshold_secs: 60 * 60,
            cipher: None,
            digest: DigestAlgorithm::Sha256,
            key_file: None,
        }
    }
}

impl TicketConfig {
    /// Reads a YAML or JSON config, picking the format from the file extension.
    pub async fn load(path: &Path) -> Result<Self, TicketError> {
        let source = tokio::fs::read_to_string(path).await.map_err(|err| {
            TicketError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let config = Self::parse(&source, path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(source: &str, path: &Path) -> Result<Self, TicketError> {
        let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        if ext.eq_ignore_ascii_case("json") {
            serde_json::from_str(source).map_err(|err| {
                TicketError::Configuration(format!("{} is not valid JSON: {err}", path.display()))
            })
        } else {
            serde_yaml::from_str(source).map_err(|err| {
                TicketError::Configuration(format!("{} is not valid YAML: {err}", path.display()))
            })
        }
    }

    pub fn validate(&self) -> Result<(), TicketError> {
        if self.key_lifetime_secs == 0 {
            return Err(TicketError::Configuration(
                "key_lifetime_secs must be greater than zero".into(),
            ));
        }
        if self.rotate_before_expiry_secs >= self.key_lifetime_secs {
            return Err(TicketError::Configuration(format!(
                "rotate_before_expiry_secs ({}) must be shorter than key_lifetime_secs ({})",
                self.rotate_before_expiry_secs, self.key_lifetime_secs
            )));
        }
        // Renewing earlier than rotation would reissue tickets under the key being replaced.
        if self.renewal_threshold_secs > self.rotate_before_expiry_secs {
            return Err(TicketError::Configuration(format!(
                "renewal_threshold_secs ({}) must not exceed rotate_before_expiry_secs ({})",
                self.renewal_threshold_secs, self.rotate_before_expiry_secs
            )));
        }
        Ok(())
    }

    pub fn cipher(&self) -> CipherAlgorithm {
        self.cipher.unwrap_or_else(CipherAlgorithm::preferred)
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy::default()
            .with_lifetime(Duration::from_secs(self.key_lifetime_secs))
            .with_rotate_before_expiry(Duration::from_secs(self.rotate_before_expiry_secs))
            .with_algorithms(self.cipher(), self.digest)
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy::new(Duration::from_secs(self.renewal_threshold_secs))
    }

    /// Builds the process-wide store, seeded from `key_file` when one is set.
    pub fn build_store(
        &self,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn RandomSource>,
    ) -> Result<Arc<InMemoryKeyStore>, TicketError> {
        self.validate()?;
        let records = match &self.key_file {
            Some(path) => KeyFile::load_or_default(path)
                .and_then(|file| file.records())
                .map_err(|err| {
                    TicketError::Configuration(format!("key file {}: {err}", path.display()))
                })?,
            None => Vec::new(),
        };
        let seeded = records.len();
        let store =
            InMemoryKeyStore::from_records(self.rotation_policy(), clock, entropy, records)?;
        info!(
            target: "stek::store",
            seeded,
            cipher = self.cipher().label(),
            lifetime_secs = self.key_lifetime_secs,
            "ticket key store ready"
        );
        Ok(Arc::new(store))
    }

    /// Builds a negotiator over a fresh store. Disabled configs yield a
    /// negotiator that never touches tickets.
    pub fn build_with(
        &self,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn RandomSource>,
    ) -> Result<TicketNegotiator, TicketError> {
        if !self.enabled {
            return Ok(TicketNegotiator::disabled());
        }
        let store = self.build_store(Arc::clone(&clock), Arc::clone(&entropy))?;
        let dispatcher = TicketKeyDispatcher::new(store, self.renewal_policy())
            .with_clock(clock)
            .with_entropy(entropy);
        Ok(TicketNegotiator::new(Arc::new(dispatcher)))
    }

    pub fn build(&self) -> Result<TicketNegotiator, TicketError> {
        let entropy = ReseedingEntropy::new()?;
        self.build_with(Arc::new(SystemClock), Arc::new(entropy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_and_json_agree() {
        let yaml = "key_lifetime_secs: 7200\nrotate_before_expiry_secs: 600\nrenewal_threshold_secs: 300\ncipher: chacha20-poly1305\ndigest: sha384\n";
        let json = r#"{"key_lifetime_secs":7200,"rotate_before_expiry_secs":600,"renewal_threshold_secs":300,"cipher":"chacha20-poly1305","digest":"sha384"}"#;
        let from_yaml = TicketConfig::parse(yaml, Path::new("tickets.yaml")).expect("yaml");
        let from_json = TicketConfig::parse(json, Path::new("tickets.JSON")).expect("json");
        assert_eq!(from_yaml, from_json);
        assert!(from_yaml.enabled);
        assert_eq!(from_yaml.cipher(), CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(from_yaml.digest, DigestAlgorithm::Sha384);
        from_yaml.validate().expect("valid");
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = TicketConfig::parse("{}", Path::new("tickets.yml")).expect("parse");
        assert_eq!(config, TicketConfig::default());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_inconsistent_windows() {
        let zero = TicketConfig {
            key_lifetime_secs: 0,
            ..TicketConfig::default()
        };
        assert!(matches!(zero.validate(), Err(TicketError::Configuration(_))));

        let rotate_too_long = TicketConfig {
            key_lifetime_secs: 600,
            rotate_before_expiry_secs: 600,
            renewal_threshold_secs: 0,
            ..TicketConfig::default()
        };
        assert!(rotate_too_long.validate().is_err());

        let renew_before_rotate = TicketConfig {
            rotate_before_expiry_secs: 300,
            renewal_threshold_secs: 301,
            ..TicketConfig::default()
        };
        assert!(renew_before_rotate.validate().is_err());
    }

    #[test]
    fn unknown_cipher_is_a_configuration_error() {
        let err = TicketConfig::parse("cipher: rc4\n", Path::new("tickets.yaml")).unwrap_err();
        assert!(matches!(err, TicketError::Configuration(_)));
    }

    #[test]
    fn disabled_config_builds_disabled_negotiator() {
        let config = TicketConfig {
            enabled: false,
            ..TicketConfig::default()
        };
        let negotiator = config.build().expect("build");
        assert!(!negotiator.is_enabled());
    }
}
