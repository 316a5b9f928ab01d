//! Messenger configuration.

use std::collections::BTreeMap;

use hublink_core::{ReceiverSettleMode, SenderSettleMode};

use crate::error::MessengerError;

/// Option name for the send-queue enqueue-age limit (integer seconds).
pub const OPTION_EVENT_SEND_TIMEOUT_SECS: &str = "amqp_event_send_timeout_secs";

/// Option name for the opaque send-queue options blob.
pub const OPTION_MESSAGE_QUEUE_OPTIONS: &str = "amqp_message_queue_options";

/// Configuration for one link direction.
///
/// A sender uses `target_suffix`, a receiver uses `source_suffix`; the
/// unused field may stay empty. Attach properties are encoded on the
/// wire as symbol keys with string values.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address suffix for a receiver link source, e.g. `messages/devicebound`.
    pub source_suffix: String,
    /// Address suffix for a sender link target, e.g. `messages/events`.
    pub target_suffix: String,
    /// Sender settlement mode for the attach frame.
    pub sender_settle_mode: SenderSettleMode,
    /// Receiver settlement mode for the attach frame.
    pub receiver_settle_mode: ReceiverSettleMode,
    /// Properties attached to the link before open.
    pub attach_properties: BTreeMap<String, String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            source_suffix: String::new(),
            target_suffix: String::new(),
            sender_settle_mode: SenderSettleMode::Settled,
            receiver_settle_mode: ReceiverSettleMode::First,
            attach_properties: BTreeMap::new(),
        }
    }
}

/// Configuration for an [`AmqpMessenger`](crate::AmqpMessenger).
///
/// All strings and the attach-properties maps are cloned at creation;
/// the caller keeps ownership of the original.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Client version string the host advertises.
    pub client_version: String,
    /// Device identity.
    pub device_id: String,
    /// Fully qualified hostname of the service.
    pub host_fqdn: String,
    /// Sender link configuration.
    pub send_link: LinkConfig,
    /// Receiver link configuration.
    pub receive_link: LinkConfig,
}

impl MessengerConfig {
    pub(crate) fn validate(&self) -> Result<(), MessengerError> {
        if self.client_version.is_empty() {
            return Err(MessengerError::InvalidConfig("client_version is empty"));
        }
        if self.device_id.is_empty() {
            return Err(MessengerError::InvalidConfig("device_id is empty"));
        }
        if self.host_fqdn.is_empty() {
            return Err(MessengerError::InvalidConfig("host_fqdn is empty"));
        }
        if self.receive_link.source_suffix.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "receive_link.source_suffix is empty",
            ));
        }
        if self.send_link.target_suffix.is_empty() {
            return Err(MessengerError::InvalidConfig(
                "send_link.target_suffix is empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MessengerConfig {
        MessengerConfig {
            client_version: "client/1.0".into(),
            device_id: "dev-1".into(),
            host_fqdn: "h.example".into(),
            send_link: LinkConfig {
                target_suffix: "messages/events".into(),
                ..LinkConfig::default()
            },
            receive_link: LinkConfig {
                source_suffix: "messages/devicebound".into(),
                ..LinkConfig::default()
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let mut config = valid_config();
        config.device_id.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.send_link.target_suffix.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.receive_link.source_suffix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_settle_modes() {
        let link = LinkConfig::default();
        assert_eq!(link.sender_settle_mode, SenderSettleMode::Settled);
        assert_eq!(link.receiver_settle_mode, ReceiverSettleMode::First);
    }
}
