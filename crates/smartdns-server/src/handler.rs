//! Query handler interface.

use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::Message;

use super::{Protocol, MAX_UDP_PAYLOAD};

/// Context for a DNS query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Client address.
    pub client: SocketAddr,

    /// Protocol used.
    pub protocol: Protocol,

    /// When the query was received.
    pub received_at: Instant,

    /// EDNS UDP payload size advertised by the client, if any.
    pub udp_size: Option<u16>,

    /// Connection ID (TCP only).
    pub connection_id: Option<u64>,
}

impl QueryContext {
    /// Creates a new query context.
    pub fn new(client: SocketAddr, protocol: Protocol) -> Self {
        Self {
            client,
            protocol,
            received_at: Instant::now(),
            udp_size: None,
            connection_id: None,
        }
    }

    /// Sets the EDNS UDP size.
    pub fn with_udp_size(mut self, size: u16) -> Self {
        self.udp_size = Some(size);
        self
    }

    /// Sets the connection ID.
    pub fn with_connection_id(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Returns the maximum response size for this transport. UDP is capped
    /// at the advertised EDNS payload (default 512), never above our own
    /// buffer; TCP messages are bounded by the length prefix alone.
    pub fn max_response_size(&self) -> usize {
        match self.protocol {
            Protocol::Udp => self.udp_size.unwrap_or(512).min(MAX_UDP_PAYLOAD) as usize,
            Protocol::Tcp => u16::MAX as usize,
        }
    }
}

/// Query handler trait implemented by the query engine.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handles a DNS query.
    ///
    /// Returning `None` drops the query without a response; the listener
    /// sends nothing and the client times out. This is the soft-failure
    /// path for upstream resolution errors.
    async fn handle(&self, query: Message, context: QueryContext) -> Option<Message>;
}

/// A handler that refuses every query. Useful for listener tests.
pub struct RefusedHandler;

#[async_trait]
impl QueryHandler for RefusedHandler {
    async fn handle(&self, query: Message, _context: QueryContext) -> Option<Message> {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(hickory_proto::op::MessageType::Response);
        response.set_op_code(query.op_code());
        response.set_response_code(hickory_proto::op::ResponseCode::Refused);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_response_size_honors_edns_up_to_our_buffer() {
        let ctx = QueryContext::new("127.0.0.1:12345".parse().unwrap(), Protocol::Udp);
        assert_eq!(ctx.max_response_size(), 512);

        let ctx = ctx.with_udp_size(1232);
        assert_eq!(ctx.max_response_size(), 1232);

        let ctx = QueryContext::new("127.0.0.1:12345".parse().unwrap(), Protocol::Udp)
            .with_udp_size(65000);
        assert_eq!(ctx.max_response_size(), MAX_UDP_PAYLOAD as usize);

        let tcp = QueryContext::new("127.0.0.1:12345".parse().unwrap(), Protocol::Tcp);
        assert_eq!(tcp.max_response_size(), 65535);
    }
}
