pub mod lifecycle;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use tracing::level_filters::LevelFilter;

use crate::attestation::claims::Claim;
use crate::error::ConfigError;

/// Maximum length in bytes of each backend selector string.
pub const MAX_SELECTOR_LEN: usize = 32;

/// Which end of the attested channel this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Verbosity of the attested channel library, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    /// The equivalent `tracing` filter.
    pub fn filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Fatal => LevelFilter::ERROR,
            Self::None => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "off" => Ok(Self::None),
            _ => Err(ConfigError::UnknownLogLevel(s.to_string())),
        }
    }
}

/// Certificate algorithm requested from the TLS backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertAlgo {
    #[default]
    Default,
    EcdsaP256Sha256,
    Rsa3072Sha256,
}

/// Session flag bits consumed by the library at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfFlags(u32);

impl ConfFlags {
    pub const SERVER: u32 = 1 << 0;
    pub const MUTUAL: u32 = 1 << 1;
    pub const PROVIDE_ENDORSEMENTS: u32 = 1 << 2;

    pub const fn from_raw(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_server(self) -> bool {
        self.0 & Self::SERVER != 0
    }

    pub const fn is_mutual(self) -> bool {
        self.0 & Self::MUTUAL != 0
    }

    pub const fn provides_endorsements(self) -> bool {
        self.0 & Self::PROVIDE_ENDORSEMENTS != 0
    }
}

/// Immutable configuration for one attested session.
///
/// Built once through [`SessionConfig::builder`] and handed to
/// [`Session::init`](crate::Session::init). There are no setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    role: Role,
    attester_type: String,
    verifier_type: String,
    tls_type: String,
    crypto_type: String,
    flags: ConfFlags,
    cert_algo: CertAlgo,
    custom_claims: Vec<Claim>,
    log_level: LogLevel,
}

impl SessionConfig {
    /// Create a builder for constructing a `SessionConfig`.
    pub fn builder(role: Role) -> SessionConfigBuilder {
        SessionConfigBuilder::new(role)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn attester_type(&self) -> &str {
        &self.attester_type
    }

    pub fn verifier_type(&self) -> &str {
        &self.verifier_type
    }

    pub fn tls_type(&self) -> &str {
        &self.tls_type
    }

    pub fn crypto_type(&self) -> &str {
        &self.crypto_type
    }

    pub fn flags(&self) -> ConfFlags {
        self.flags
    }

    pub fn mutual(&self) -> bool {
        self.flags.is_mutual()
    }

    pub fn provide_endorsements(&self) -> bool {
        self.flags.provides_endorsements()
    }

    pub fn cert_algo(&self) -> CertAlgo {
        self.cert_algo
    }

    /// Claims embedded in this side's evidence, in insertion order.
    pub fn custom_claims(&self) -> &[Claim] {
        &self.custom_claims
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }
}

/// Builder for [`SessionConfig`].
///
/// Every argument is copied into the builder, so callers may drop their
/// originals as soon as a setter returns.
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    role: Role,
    attester_type: String,
    verifier_type: String,
    tls_type: String,
    crypto_type: String,
    mutual: bool,
    provide_endorsements: bool,
    cert_algo: CertAlgo,
    custom_claims: Vec<Claim>,
    log_level: LogLevel,
}

impl SessionConfigBuilder {
    fn new(role: Role) -> Self {
        Self {
            role,
            attester_type: String::new(),
            verifier_type: String::new(),
            tls_type: String::new(),
            crypto_type: String::new(),
            mutual: false,
            provide_endorsements: false,
            cert_algo: CertAlgo::default(),
            custom_claims: Vec::new(),
            log_level: LogLevel::default(),
        }
    }

    pub fn attester_type(mut self, name: &str) -> Self {
        self.attester_type = name.to_owned();
        self
    }

    pub fn verifier_type(mut self, name: &str) -> Self {
        self.verifier_type = name.to_owned();
        self
    }

    pub fn tls_type(mut self, name: &str) -> Self {
        self.tls_type = name.to_owned();
        self
    }

    pub fn crypto_type(mut self, name: &str) -> Self {
        self.crypto_type = name.to_owned();
        self
    }

    pub fn mutual(mut self, enabled: bool) -> Self {
        self.mutual = enabled;
        self
    }

    pub fn provide_endorsements(mut self, enabled: bool) -> Self {
        self.provide_endorsements = enabled;
        self
    }

    pub fn cert_algo(mut self, algo: CertAlgo) -> Self {
        self.cert_algo = algo;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Append a custom claim. Names are not checked for uniqueness.
    pub fn claim(mut self, name: &str, value: &[u8]) -> Self {
        self.custom_claims
            .push(Claim::new(name, Bytes::copy_from_slice(value)));
        self
    }

    /// Build the `SessionConfig`, rejecting oversized selectors.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        for (field, value) in [
            ("attester_type", &self.attester_type),
            ("verifier_type", &self.verifier_type),
            ("tls_type", &self.tls_type),
            ("crypto_type", &self.crypto_type),
        ] {
            if value.len() > MAX_SELECTOR_LEN {
                return Err(ConfigError::FieldTooLong {
                    field,
                    len: value.len(),
                    max: MAX_SELECTOR_LEN,
                });
            }
        }

        let mut flags = 0;
        if self.role == Role::Server {
            flags |= ConfFlags::SERVER;
        }
        if self.mutual {
            flags |= ConfFlags::MUTUAL;
        }
        if self.provide_endorsements {
            flags |= ConfFlags::PROVIDE_ENDORSEMENTS;
        }

        Ok(SessionConfig {
            role: self.role,
            attester_type: self.attester_type,
            verifier_type: self.verifier_type,
            tls_type: self.tls_type,
            crypto_type: self.crypto_type,
            flags: ConfFlags::from_raw(flags),
            cert_algo: self.cert_algo,
            custom_claims: self.custom_claims,
            log_level: self.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent_bits() {
        let config = SessionConfig::builder(Role::Server)
            .provide_endorsements(true)
            .build()
            .unwrap();
        assert!(config.flags().is_server());
        assert!(!config.mutual());
        assert!(config.provide_endorsements());
        assert_eq!(
            config.flags().raw(),
            ConfFlags::SERVER | ConfFlags::PROVIDE_ENDORSEMENTS
        );

        let config = SessionConfig::builder(Role::Client)
            .mutual(true)
            .build()
            .unwrap();
        assert_eq!(config.flags().raw(), ConfFlags::MUTUAL);
    }

    #[test]
    fn oversized_selector_rejected() {
        let long = "x".repeat(MAX_SELECTOR_LEN + 1);
        let err = SessionConfig::builder(Role::Client)
            .verifier_type(&long)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::FieldTooLong {
                field: "verifier_type",
                len: MAX_SELECTOR_LEN + 1,
                max: MAX_SELECTOR_LEN,
            }
        );
    }

    #[test]
    fn selector_at_limit_accepted() {
        let exact = "y".repeat(MAX_SELECTOR_LEN);
        let config = SessionConfig::builder(Role::Server)
            .tls_type(&exact)
            .build()
            .unwrap();
        assert_eq!(config.tls_type(), exact);
    }

    #[test]
    fn claims_are_copied_in_order() {
        let mut value = b"value_0".to_vec();
        let builder = SessionConfig::builder(Role::Server)
            .claim("key_0", &value)
            .claim("key_1", b"value_1");
        value.clear();

        let config = builder.build().unwrap();
        let claims = config.custom_claims();
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].name, "key_0");
        assert_eq!(&claims[0].value[..], b"value_0");
        assert_eq!(claims[1].name, "key_1");
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("off".parse::<LogLevel>().unwrap(), LogLevel::None);
        assert_eq!(LogLevel::Fatal.filter(), LevelFilter::ERROR);
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(ConfigError::UnknownLogLevel(_))
        ));
        assert!(LogLevel::Debug < LogLevel::Warn);
    }
}
