//! Protocol parsers. HTTP is fully implemented; further protocol families
//! plug in through [`crate::proxy::demux::ProtocolParser`] and flows no
//! parser claims are passed through verbatim.

pub mod http;

use std::sync::Arc;

use crate::proxy::demux::ParserRegistry;

/// Registry with the built-in parsers, in classification order.
pub fn default_registry() -> ParserRegistry {
    let mut registry = ParserRegistry::new();
    registry.register(Arc::new(http::HttpParser));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_claims_http() {
        let registry = default_registry();
        assert!(registry.classify(b"GET / HTTP/1.1\r\n").is_some());
        assert!(registry.classify(b"\x00binary").is_none());
    }
}
