//! IANA root server hints.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A root server entry.
#[derive(Debug, Clone)]
pub struct RootServer {
    /// Hostname of the root server.
    pub name: &'static str,
    /// IPv4 address.
    pub ipv4: Ipv4Addr,
}

/// The 13 IANA root servers, IPv4. These are the starting points for
/// iterative resolution.
pub static ROOT_SERVERS: &[RootServer] = &[
    RootServer {
        name: "a.root-servers.net.",
        ipv4: Ipv4Addr::new(198, 41, 0, 4),
    },
    RootServer {
        name: "b.root-servers.net.",
        ipv4: Ipv4Addr::new(199, 9, 14, 201),
    },
    RootServer {
        name: "c.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 33, 4, 12),
    },
    RootServer {
        name: "d.root-servers.net.",
        ipv4: Ipv4Addr::new(199, 7, 91, 13),
    },
    RootServer {
        name: "e.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 203, 230, 10),
    },
    RootServer {
        name: "f.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 5, 5, 241),
    },
    RootServer {
        name: "g.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 112, 36, 4),
    },
    RootServer {
        name: "h.root-servers.net.",
        ipv4: Ipv4Addr::new(198, 97, 190, 53),
    },
    RootServer {
        name: "i.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 36, 148, 17),
    },
    RootServer {
        name: "j.root-servers.net.",
        ipv4: Ipv4Addr::new(192, 58, 128, 30),
    },
    RootServer {
        name: "k.root-servers.net.",
        ipv4: Ipv4Addr::new(193, 0, 14, 129),
    },
    RootServer {
        name: "l.root-servers.net.",
        ipv4: Ipv4Addr::new(199, 7, 83, 42),
    },
    RootServer {
        name: "m.root-servers.net.",
        ipv4: Ipv4Addr::new(202, 12, 27, 33),
    },
];

/// Returns `host:53` addresses for every root server, in list order.
pub fn root_server_addrs() -> Vec<SocketAddr> {
    ROOT_SERVERS
        .iter()
        .map(|root| SocketAddr::new(IpAddr::V4(root.ipv4), 53))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thirteen_roots() {
        assert_eq!(ROOT_SERVERS.len(), 13);
        let addrs = root_server_addrs();
        assert_eq!(addrs.len(), 13);
        assert!(addrs.iter().all(|a| a.port() == 53));
    }
}
