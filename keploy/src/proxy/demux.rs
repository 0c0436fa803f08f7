use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::mock::MockStore;
use crate::models::{Kind, Mock, Mode};

/// Everything a parser needs beyond the sockets: where captured mocks go,
/// where replay mocks come from, and which hosts bypass interception.
#[derive(Clone)]
pub struct ParserCtx {
    /// Captured outgoing interactions land here during record.
    pub mocks_tx: Option<mpsc::Sender<Mock>>,
    /// Source of recorded responses during replay.
    pub mock_store: Arc<MockStore>,
    /// Hosts relayed verbatim and never mocked or captured.
    pub bypass_hosts: Arc<Vec<String>>,
    /// Original destination of this connection, when the kernel knew it.
    pub dest_addr: Option<SocketAddr>,
    /// Session-wide counter used to name captured mocks in capture order.
    pub mock_counter: Arc<AtomicU64>,
}

impl ParserCtx {
    pub fn is_bypassed_host(&self, host: &str) -> bool {
        let bare = host.split(':').next().unwrap_or(host);
        self.bypass_hosts.iter().any(|h| h == host || h == bare)
    }

    /// Next mock name, unique for the session.
    pub fn next_mock_name(&self) -> String {
        format!("mock-{}", self.mock_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// One wire-protocol family the proxy understands.
///
/// `outgoing_type` is the classification predicate, evaluated on the first
/// bytes of a new flow; it must be pure. `process_outgoing` then owns the
/// connection for its lifetime, in the mode the session was started in.
#[async_trait]
pub trait ProtocolParser: Send + Sync {
    fn kind(&self) -> Kind;

    /// Does the first packet of a flow belong to this protocol?
    fn outgoing_type(&self, prefix: &[u8]) -> bool;

    async fn process_outgoing(
        &self,
        prefix: &[u8],
        client: TcpStream,
        dest: Option<TcpStream>,
        mode: Mode,
        ctx: ParserCtx,
    ) -> Result<()>;
}

/// Order-preserving parser registry; the first parser whose predicate claims
/// a prefix wins, and an unclaimed flow is passed through verbatim.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ProtocolParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, parser: Arc<dyn ProtocolParser>) {
        self.parsers.push(parser);
    }

    pub fn classify(&self, prefix: &[u8]) -> Option<Arc<dyn ProtocolParser>> {
        self.parsers
            .iter()
            .find(|p| p.outgoing_type(prefix))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixParser {
        kind: Kind,
        prefix: &'static [u8],
    }

    #[async_trait]
    impl ProtocolParser for PrefixParser {
        fn kind(&self) -> Kind {
            self.kind
        }

        fn outgoing_type(&self, prefix: &[u8]) -> bool {
            prefix.starts_with(self.prefix)
        }

        async fn process_outgoing(
            &self,
            _prefix: &[u8],
            _client: TcpStream,
            _dest: Option<TcpStream>,
            _mode: Mode,
            _ctx: ParserCtx,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_registered_match_wins() {
        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(PrefixParser {
            kind: Kind::Redis,
            prefix: b"*",
        }));
        registry.register(Arc::new(PrefixParser {
            kind: Kind::Generic,
            prefix: b"*",
        }));

        let chosen = registry.classify(b"*1\r\n").expect("claimed");
        assert_eq!(chosen.kind(), Kind::Redis);
    }

    #[test]
    fn unclaimed_flow_is_none() {
        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(PrefixParser {
            kind: Kind::Redis,
            prefix: b"*",
        }));
        assert!(registry.classify(b"\x00\x01").is_none());
    }
}
