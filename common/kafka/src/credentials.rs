use std::fmt;
use std::str::FromStr;

use rdkafka::ClientConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("secret value must not be empty")]
pub struct EmptySecretError;

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl FromStr for Secret {
    type Err = EmptySecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(EmptySecretError)
        } else {
            Ok(Secret(s.to_owned()))
        }
    }
}

/// Username/password pair for SASL authentication.
///
/// Applied to the client as the structured `sasl.username` / `sasl.password`
/// properties rather than being spliced into a JAAS string.
#[derive(Clone, Debug)]
pub struct SaslCredentials {
    pub username: String,
    pub password: Secret,
}

impl SaslCredentials {
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    pub fn apply(&self, config: &mut ClientConfig) {
        config
            .set("sasl.username", &self.username)
            .set("sasl.password", self.password.expose());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_the_secret() {
        let credentials = SaslCredentials::new("key", "hunter2".parse().unwrap());

        let rendered = format!("{credentials:?}");

        assert!(rendered.contains("key"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(***)"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert_eq!("".parse::<Secret>(), Err(EmptySecretError));
    }

    #[test]
    fn credentials_are_set_as_properties() {
        let credentials = SaslCredentials::new("key", "hunter2".parse().unwrap());
        let mut config = ClientConfig::new();

        credentials.apply(&mut config);

        assert_eq!(config.get("sasl.username"), Some("key"));
        assert_eq!(config.get("sasl.password"), Some("hunter2"));
        assert_eq!(config.get("sasl.jaas.config"), None);
    }
}
