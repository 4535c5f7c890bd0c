//! Endpoint lifecycle notifications

use std::collections::BTreeMap;

pub const ENDPOINT_STARTED: &str = "STARTED";
pub const ENDPOINT_FAILED: &str = "FAILED";

pub const ENDPOINT_ACTIVE_HOST: &str = "activeHost";
pub const ENDPOINT_ACTIVE_PORT: &str = "activePort";
pub const ENDPOINT_CONFIG_HOST: &str = "configHost";
pub const ENDPOINT_CONFIG_PORT: &str = "configPort";
pub const ENDPOINT_IS_TLS: &str = "isTLS";
pub const ENDPOINT_EXCEPTION: &str = "exception";

pub type EventProperties = BTreeMap<&'static str, String>;

/// Sink for endpoint events, usually an event bus of the host.
///
/// Topics are the owner's event topic followed by [`ENDPOINT_STARTED`] or [`ENDPOINT_FAILED`].
pub trait EventPublisher: Send + Sync {
    fn post_event(&self, topic: &str, properties: EventProperties);
}

/// Publisher which only logs the events
#[derive(Debug, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn post_event(&self, topic: &str, properties: EventProperties) {
        log::info!("{topic} {properties:?}");
    }
}
