use super::{ChainKind, ChainNames, ChainOwner};
use crate::config::Options;
use crate::events::{
    ENDPOINT_ACTIVE_HOST, ENDPOINT_ACTIVE_PORT, ENDPOINT_CONFIG_HOST, ENDPOINT_CONFIG_PORT,
    EventProperties,
};
use std::fmt;

/// Host used when the endpoint configures none
const DEFAULT_HOST: &str = "localhost";

/// Immutable snapshot of the effective settings of a chain.
///
/// Every update builds a new snapshot, a published snapshot is never changed. The active
/// host and port are learned once the listener is bound and produce another snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConfiguration {
    kind: ChainKind,
    endpoint_id: String,
    config_host: String,
    config_port: Option<u16>,
    active_host: Option<String>,
    active_port: Option<u16>,
    transport_options: Options,
    tls_options: Option<Options>,

    valid: bool,
    channel_list: Vec<String>,
    transport_properties: Options,
    sip_properties: Options,
}

impl ActiveConfiguration {
    /// Read the current options of `owner`
    pub(crate) fn build(kind: ChainKind, owner: &dyn ChainOwner) -> Self {
        let endpoint = owner.endpoint_options();

        let config_port = match kind {
            ChainKind::Tcp => endpoint.tcp_port,
            ChainKind::Tls => endpoint.tls_port,
            ChainKind::Udp => endpoint.udp_port,
        };

        let transport_options = match kind {
            ChainKind::Tcp | ChainKind::Tls => owner.tcp_options(),
            ChainKind::Udp => owner.udp_options(),
        };

        let tls_options = match kind {
            ChainKind::Tls => owner.tls_options(),
            ChainKind::Tcp | ChainKind::Udp => None,
        };

        let config_host = if endpoint.host.trim().is_empty() {
            DEFAULT_HOST.into()
        } else {
            endpoint.host
        };

        Self {
            kind,
            endpoint_id: endpoint.id,
            config_host,
            config_port,
            active_host: None,
            active_port: None,
            transport_options,
            tls_options,
            valid: false,
            channel_list: Vec::new(),
            transport_properties: Options::new(),
            sip_properties: Options::new(),
        }
    }

    /// Dependent resources are available (TLS material for TLS chains)
    pub fn is_ready(&self) -> bool {
        match self.kind {
            ChainKind::Tls => self.tls_options.is_some(),
            ChainKind::Tcp | ChainKind::Udp => true,
        }
    }

    /// Port configured and resources ready, channels can be created
    pub fn is_complete(&self) -> bool {
        self.config_port.is_some() && self.is_ready()
    }

    /// Channels were created for this configuration
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Describes why an incomplete configuration cannot be started
    pub fn problem(&self) -> Option<&'static str> {
        if self.config_port.is_none() {
            Some("no port configured")
        } else if !self.is_ready() {
            Some("TLS options are not available")
        } else {
            None
        }
    }

    /// Same effective settings, ignoring everything learned at runtime
    pub fn unchanged(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.endpoint_id == other.endpoint_id
            && self.config_host == other.config_host
            && self.config_port == other.config_port
            && self.transport_options == other.transport_options
            && self.tls_options == other.tls_options
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn config_host(&self) -> &str {
        &self.config_host
    }

    /// Configured port or -1 if none is configured
    pub fn config_port(&self) -> i32 {
        self.config_port.map_or(-1, i32::from)
    }

    pub fn active_host(&self) -> Option<&str> {
        self.active_host.as_deref()
    }

    /// Bound port or -1 if the chain is not bound
    pub fn active_port(&self) -> i32 {
        self.active_port.map_or(-1, i32::from)
    }

    pub fn channel_list(&self) -> &[String] {
        &self.channel_list
    }

    /// Properties of the transport channel: the transport options plus endpoint name,
    /// host name and port
    pub fn transport_properties(&self) -> &Options {
        &self.transport_properties
    }

    /// Properties of the SIP channel: endpoint name and protocol type
    pub fn sip_properties(&self) -> &Options {
        &self.sip_properties
    }

    /// Snapshot with the channel list and channel properties of `names`. Marks the
    /// configuration as valid.
    pub(crate) fn with_channels(&self, names: &ChainNames) -> Self {
        let mut transport_properties = self.transport_options.clone();
        transport_properties.insert("endPointName".into(), names.endpoint().into());
        transport_properties.insert("hostname".into(), self.config_host.clone());
        transport_properties.insert("port".into(), self.config_port().to_string());

        let mut sip_properties = Options::new();
        sip_properties.insert("endPointName".into(), self.endpoint_id.clone());
        sip_properties.insert(
            "channelChainProtocolType".into(),
            self.kind.protocol_type().into(),
        );

        Self {
            valid: true,
            channel_list: names.channel_list().map(String::from).collect(),
            transport_properties,
            sip_properties,
            ..self.clone()
        }
    }

    /// Snapshot with the address the chain was bound to
    pub(crate) fn with_active(&self, host: Option<String>, port: Option<u16>) -> Self {
        Self {
            active_host: host,
            active_port: port,
            ..self.clone()
        }
    }

    pub(crate) fn event_properties(&self) -> EventProperties {
        let mut properties = EventProperties::new();

        if let Some(active_host) = &self.active_host {
            properties.insert(ENDPOINT_ACTIVE_HOST, active_host.clone());
        }

        properties.insert(ENDPOINT_ACTIVE_PORT, self.active_port().to_string());
        properties.insert(ENDPOINT_CONFIG_HOST, self.config_host.clone());
        properties.insert(ENDPOINT_CONFIG_PORT, self.config_port().to_string());

        properties
    }
}

impl fmt::Display for ActiveConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[host={},port={},active={}:{},valid={},ready={}]",
            self.kind,
            self.config_host,
            self.config_port(),
            self.active_host.as_deref().unwrap_or("-"),
            self.active_port(),
            self.valid,
            self.is_ready(),
        )
    }
}
