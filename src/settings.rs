use std::sync::Arc;

use crate::config::{Config, ConnectionConfig, SendfileConfig, WebSocketConfig};
use crate::http::handler::Handler;
use crate::http::parser::ParseLimits;
use crate::registry::ConnectionRegistry;

/// Everything a connection needs besides its transport; shared by all
/// connections of a server.
pub struct ConnectionSettings {
    pub handler: Arc<dyn Handler>,
    pub registry: Arc<ConnectionRegistry>,
    pub connection: ConnectionConfig,
    pub sendfile: SendfileConfig,
    pub websocket: WebSocketConfig,
}

impl ConnectionSettings {
    pub fn new(handler: impl Handler) -> Self {
        Self::from_config(&Config::default(), handler)
    }

    pub fn from_config(config: &Config, handler: impl Handler) -> Self {
        Self {
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            connection: config.connection.clone(),
            sendfile: config.sendfile.clone(),
            websocket: config.websocket.clone(),
        }
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_header_size: self.connection.max_header_size,
            max_body_size: self.connection.max_body_size,
        }
    }
}
