//! Node connection strings: `<node_id>@<host>[:port]`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::ConnectError;

/// Lightning's default peer port.
pub const DEFAULT_PORT: u16 = 9735;

/// Length of a compressed secp256k1 public key.
pub const NODE_ID_LEN: usize = 33;

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    /// Compressed public key of the node.
    pub node_id: [u8; NODE_ID_LEN],
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Node id as lower-case hex.
    pub fn node_id_hex(&self) -> String {
        hex::encode(self.node_id)
    }

    /// Resolve the host to socket addresses, in resolver order.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectError::Resolve {
                host: self.host.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }
        Ok(addrs)
    }
}

fn parse_node_id(s: &str) -> Result<[u8; NODE_ID_LEN], ConnectError> {
    let bytes = hex::decode(s)
        .map_err(|e| ConnectError::InvalidAddress(format!("node id is not hex: {}", e)))?;
    let node_id: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
        ConnectError::InvalidAddress(format!(
            "node id must be {} bytes, got {}",
            NODE_ID_LEN,
            b.len()
        ))
    })?;
    if node_id[0] != 0x02 && node_id[0] != 0x03 {
        return Err(ConnectError::InvalidAddress(
            "node id is not a compressed public key".into(),
        ));
    }
    Ok(node_id)
}

fn parse_port(s: &str) -> Result<u16, ConnectError> {
    s.parse()
        .map_err(|_| ConnectError::InvalidAddress(format!("invalid port {:?}", s)))
}

/// Split `host[:port]`, handling bracketed and bare IPv6 literals.
fn parse_host_port(s: &str) -> Result<(String, u16), ConnectError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConnectError::InvalidAddress(format!("unclosed bracket in {:?}", s)))?;
        let port = match tail {
            "" => DEFAULT_PORT,
            _ => match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None => {
                    return Err(ConnectError::InvalidAddress(format!(
                        "unexpected {:?} after host",
                        tail
                    )))
                }
            },
        };
        return Ok((host.to_string(), port));
    }

    match s.matches(':').count() {
        0 => Ok((s.to_string(), DEFAULT_PORT)),
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            Ok((host.to_string(), parse_port(port)?))
        }
        // Unbracketed IPv6 literal; no room for a port.
        _ => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

impl FromStr for NodeAddress {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, host_port) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| ConnectError::InvalidAddress(format!("missing '@' in {:?}", s)))?;

        let node_id = parse_node_id(node_id)?;
        let (host, port) = parse_host_port(host_port)?;
        if host.is_empty() {
            return Err(ConnectError::InvalidAddress("empty host".into()));
        }

        Ok(Self {
            node_id,
            host,
            port,
        })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.node_id_hex(), self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.node_id_hex(), self.host, self.port)
        }
    }
}
