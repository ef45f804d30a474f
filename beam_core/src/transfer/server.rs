use super::ReceiverContext;
use super::receiver::FileReceiver;
use crate::Result;
use crate::discovery::EndpointPayload;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// The transfer listener. Bound eagerly so its address is known before
/// anything is advertised.
pub struct TransferServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransferServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Transfer listener bound on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers should dial: the bound IPv4, or the best LAN address
    /// when bound to all interfaces.
    pub fn advertised_endpoint(&self) -> EndpointPayload {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => preferred_lan_ipv4().unwrap_or(Ipv4Addr::LOCALHOST),
        };
        EndpointPayload::new(ip, self.local_addr.port())
    }

    /// Accept until `shutdown` fires, one receiver task per connection.
    pub async fn run(self, ctx: ReceiverContext, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!("Connection from {}", peer);
                    let receiver = FileReceiver::new(stream, peer, ctx.clone());
                    tokio::spawn(receiver.run());
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }
        tracing::info!("Transfer listener on {} stopped", self.local_addr);
    }
}

/// Pick a local IPv4, preferring 192.168/16, then 10/8, then 172.16/12.
pub fn preferred_lan_ipv4() -> Option<Ipv4Addr> {
    let interfaces = local_ip_address::list_afinet_netifas().ok()?;
    let rank = |ip: &Ipv4Addr| {
        let octets = ip.octets();
        match octets {
            [192, 168, ..] => 0,
            [10, ..] => 1,
            [172, 16..=31, ..] => 2,
            _ => 3,
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(v4),
            _ => None,
        })
        .min_by_key(rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_known_right_after_bind() {
        let server = TransferServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let advertised = server.advertised_endpoint();
        assert_eq!(advertised.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(advertised.port, server.local_addr().port());
    }
}
