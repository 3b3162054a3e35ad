use rdkafka::ClientConfig;
use tracing::debug;

use crate::config::KafkaConfig;
use crate::credentials::SaslCredentials;

/// Builder for consumers that read explicit offset ranges.
///
/// The consumer never joins a group and never commits offsets: progress is tracked
/// by the caller. `group.id` is still set because rdkafka refuses to create a
/// consumer without one.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_assign_only(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            // An assigned offset outside the log is an error, never a silent jump
            .set("auto.offset.reset", "error")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Transport security and SASL mechanism from the shared config.
    pub fn with_security(mut self, kafka: &KafkaConfig) -> Self {
        self.config
            .set("security.protocol", &kafka.kafka_security_protocol)
            .set(
                "ssl.endpoint.identification.algorithm",
                &kafka.kafka_ssl_endpoint_identification,
            );

        if kafka.uses_sasl() {
            self.config
                .set("sasl.mechanism", &kafka.kafka_sasl_mechanism);
        }
        self
    }

    pub fn with_credentials(mut self, credentials: &SaslCredentials) -> Self {
        credentials.apply(&mut self.config);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        // Never log the whole ClientConfig, it carries the SASL password.
        debug!(
            bootstrap_servers = self.config.get("bootstrap.servers"),
            security_protocol = self.config.get("security.protocol"),
            sasl_mechanism = self.config.get("sasl.mechanism"),
            sasl_username = self.config.get("sasl.username"),
            "kafka consumer configured"
        );
        self.config
    }
}
