//! UDP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::op::{Edns, Message};
use smartdns_metrics::metrics;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::handler::{QueryContext, QueryHandler};
use crate::{Protocol, Result, MAX_UDP_PAYLOAD};

/// UDP DNS server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    local_addr: SocketAddr,
}

impl UdpServer {
    /// Binds a new UDP server to the given address.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn QueryHandler>) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!(addr = %local_addr, "UDP server listening");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            local_addr,
        })
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the receive loop until shutdown is signaled. Each datagram is
    /// handled in its own task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD as usize];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("UDP server stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        let socket = Arc::clone(&self.socket);
                        let handler = Arc::clone(&self.handler);

                        tokio::spawn(async move {
                            if let Err(e) = process_datagram(socket, handler, data, src).await {
                                debug!(error = %e, client = %src, "error processing UDP query");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "error receiving UDP packet");
                    }
                }
            }
        }
    }
}

async fn process_datagram(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    data: Bytes,
    src: SocketAddr,
) -> Result<()> {
    let query = match Message::from_vec(&data) {
        Ok(message) => message,
        Err(e) => {
            trace!(error = %e, client = %src, "dropping malformed DNS query");
            return Ok(());
        }
    };

    let client_payload = query.extensions().as_ref().map(Edns::max_payload);
    let mut ctx = QueryContext::new(src, Protocol::Udp);
    if let Some(size) = client_payload {
        ctx = ctx.with_udp_size(size);
    }

    let Some(mut response) = handler.handle(query, ctx.clone()).await else {
        return Ok(());
    };

    if client_payload.is_some() {
        let edns = response.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(MAX_UDP_PAYLOAD);
    }

    let mut wire = response.to_vec()?;
    if wire.len() > ctx.max_response_size() {
        wire = truncated_reply(&response).to_vec()?;
    }

    socket.send_to(&wire, src).await?;
    metrics().record_response();
    Ok(())
}

/// A copy of the response header and question with TC set; the client is
/// expected to retry over TCP.
fn truncated_reply(response: &Message) -> Message {
    let mut truncated = Message::new();
    truncated.set_id(response.id());
    truncated.set_message_type(hickory_proto::op::MessageType::Response);
    truncated.set_op_code(response.op_code());
    truncated.set_response_code(response.response_code());
    truncated.set_authoritative(response.authoritative());
    truncated.set_recursion_desired(response.recursion_desired());
    truncated.set_recursion_available(response.recursion_available());
    truncated.set_truncated(true);
    for q in response.queries() {
        truncated.add_query(q.clone());
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RefusedHandler;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let handler = Arc::new(RefusedHandler);
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();
        assert!(server.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn answers_over_the_wire() {
        let handler = Arc::new(RefusedHandler);
        let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();
        let addr = server.local_addr();

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.run(rx).await });

        let mut query = Message::new();
        query.set_id(77);
        query.set_message_type(MessageType::Query);
        query.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        socket.send(&query.to_vec().unwrap()).await.unwrap();

        let mut buf = vec![0u8; 512];
        let len = socket.recv(&mut buf).await.unwrap();
        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.id(), 77);
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }

    #[test]
    fn truncated_reply_keeps_question_only() {
        let mut response = Message::new();
        response.set_id(5);
        response.set_message_type(MessageType::Response);
        response.set_authoritative(true);
        response.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));

        let truncated = truncated_reply(&response);
        assert!(truncated.truncated());
        assert!(truncated.authoritative());
        assert_eq!(truncated.queries().len(), 1);
        assert!(truncated.answers().is_empty());
    }
}
