use envconfig::Envconfig;

/// Connection settings shared by every Kafka client in the workspace.
///
/// Defaults target the managed cluster the ingest job reads from. Credentials are
/// not part of it: they arrive as job arguments, see [`crate::SaslCredentials`].
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "pkc-p11xm.us-east-1.aws.confluent.cloud:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "SASL_SSL")]
    pub kafka_security_protocol: String, // PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL

    #[envconfig(default = "PLAIN")]
    pub kafka_sasl_mechanism: String,

    // "https" verifies the broker hostname against its certificate, "none" disables it
    #[envconfig(default = "https")]
    pub kafka_ssl_endpoint_identification: String,

    // Applies to metadata and watermark queries and to each wait for the next message
    #[envconfig(default = "10000")]
    pub kafka_operation_timeout_ms: u64,
}

impl KafkaConfig {
    pub fn uses_sasl(&self) -> bool {
        self.kafka_security_protocol
            .to_ascii_uppercase()
            .starts_with("SASL")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_managed_cluster() {
        let config = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(
            config.kafka_hosts,
            "pkc-p11xm.us-east-1.aws.confluent.cloud:9092"
        );
        assert_eq!(config.kafka_security_protocol, "SASL_SSL");
        assert_eq!(config.kafka_sasl_mechanism, "PLAIN");
        assert_eq!(config.kafka_ssl_endpoint_identification, "https");
        assert_eq!(config.kafka_operation_timeout_ms, 10000);
        assert!(config.uses_sasl());
    }

    #[test]
    fn plaintext_does_not_use_sasl() {
        let env = HashMap::from([
            ("KAFKA_HOSTS".to_string(), "localhost:9092".to_string()),
            (
                "KAFKA_SECURITY_PROTOCOL".to_string(),
                "plaintext".to_string(),
            ),
        ]);
        let config = KafkaConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert!(!config.uses_sasl());
    }
}
