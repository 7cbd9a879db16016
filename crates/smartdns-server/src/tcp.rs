//! TCP server implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use smartdns_metrics::metrics;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::handler::{QueryContext, QueryHandler};
use crate::{Protocol, Result};

/// Connection ID counter.
static CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// TCP DNS server with 2-byte length framing per RFC 1035.
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<dyn QueryHandler>,
    local_addr: SocketAddr,
    idle_timeout: Duration,
}

impl TcpServer {
    /// Binds a new TCP server to the given address.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn QueryHandler>) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "TCP server listening");

        Ok(Self {
            listener,
            handler,
            local_addr,
            idle_timeout: Duration::from_secs(10),
        })
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the idle timeout for client connections.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Runs the accept loop until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("TCP server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        let idle_timeout = self.idle_timeout;
                        let conn_id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer, handler, idle_timeout, conn_id).await
                            {
                                debug!(error = %e, client = %peer, "TCP connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "error accepting TCP connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn QueryHandler>,
    idle_timeout: Duration,
    conn_id: u64,
) -> Result<()> {
    trace!(client = %peer, conn_id, "new TCP connection");

    loop {
        let query_bytes = match timeout(idle_timeout, read_message(&mut stream)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    trace!(client = %peer, conn_id, "TCP connection closed by client");
                } else {
                    debug!(error = %e, client = %peer, "TCP read error");
                }
                return Ok(());
            }
            Err(_) => {
                trace!(client = %peer, conn_id, "TCP connection idle timeout");
                return Ok(());
            }
        };

        let query = match Message::from_vec(&query_bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, client = %peer, "dropping malformed TCP query");
                continue;
            }
        };

        let ctx = QueryContext::new(peer, Protocol::Tcp).with_connection_id(conn_id);
        let Some(response) = handler.handle(query, ctx).await else {
            continue;
        };

        let wire = response.to_vec()?;
        write_message(&mut stream, &wire).await?;
        metrics().record_response();
    }
}

/// Reads one length-prefixed DNS message.
async fn read_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty TCP message",
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed DNS message.
async fn write_message(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(data.len() as u16).to_be_bytes()).await?;
    stream.write_all(data).await?;
    Ok(())
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
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();
        assert!(server.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn answers_over_the_wire() {
        let handler = Arc::new(RefusedHandler);
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();
        let addr = server.local_addr();

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.run(rx).await });

        let mut query = Message::new();
        query.set_id(21);
        query.set_message_type(MessageType::Query);
        query.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        let wire = query.to_vec().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &wire).await.unwrap();
        let reply = read_message(&mut stream).await.unwrap();
        let response = Message::from_vec(&reply).unwrap();
        assert_eq!(response.id(), 21);
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }
}
