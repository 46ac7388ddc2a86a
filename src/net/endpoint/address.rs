/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// The kind of address, such as Domain Name or IP address. **Note** that
/// the `FromStr` implementation doesn't validate that the name is
/// resolvable, resolution belongs to the discovery source.
#[derive(Debug, PartialEq, Clone, PartialOrd, Eq, Hash, Ord)]
pub enum AddressKind {
    Name(String),
    Ip(IpAddr),
}

impl From<IpAddr> for AddressKind {
    fn from(value: IpAddr) -> Self {
        Self::Ip(value)
    }
}

impl From<Ipv4Addr> for AddressKind {
    fn from(value: Ipv4Addr) -> Self {
        Self::Ip(value.into())
    }
}

impl From<Ipv6Addr> for AddressKind {
    fn from(value: Ipv6Addr) -> Self {
        Self::Ip(value.into())
    }
}

impl FromStr for AddressKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // check for wrapping "[..]" in an ipv6 host
        let host = s
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(s);

        Ok(host
            .parse()
            .map_or_else(|_err| Self::Name(s.to_owned()), Self::Ip))
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Ip(ip) => fmt::Display::fmt(ip, f),
        }
    }
}

/// The network address of an upstream host. The stringified form
/// (`host:port`, `[v6]:port`) is the key hosts are matched on across
/// discovery updates.
#[derive(Debug, PartialEq, Clone, PartialOrd, Ord, Eq, Hash)]
pub struct EndpointAddress {
    /// A valid name or IP address that resolves to a address.
    pub host: AddressKind,
    /// The port of the socket address.
    pub port: u16,
}

impl EndpointAddress {
    pub const UNSPECIFIED: Self = Self {
        host: AddressKind::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        port: 0,
    };

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a copy of this address with `port` substituted, or the
    /// address itself when `port` is zero.
    pub fn with_port(&self, port: u16) -> Self {
        if port == 0 {
            return self.clone();
        }

        Self {
            host: self.host.clone(),
            port,
        }
    }
}

/// Parses `host:port`, with an optional `tcp://` scheme.
impl FromStr for EndpointAddress {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = if input.starts_with("tcp://") {
            url::Url::parse(input)?
        } else if input.contains("://") {
            return Err(ParseError::UnsupportedScheme);
        } else {
            url::Url::parse(&format!("tcp://{input}"))?
        };

        if !url.path().is_empty() && url.path() != "/" {
            return Err(ParseError::PathsNotAllowed);
        }

        let host = url.host_str().ok_or(ParseError::EmptyHost)?;
        let port = url.port().ok_or(ParseError::EmptyPort)?;
        let host = host
            .parse::<AddressKind>()
            .unwrap_or_else(|never| match never {});

        Ok(Self { host, port })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("only tcp:// or scheme-less addresses are permitted")]
    UnsupportedScheme,
    #[error("hostname is required")]
    EmptyHost,
    #[error("port is required")]
    EmptyPort,
    #[error("parser error: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("No paths allowed in addresses, it must include only the hostname and port")]
    PathsNotAllowed,
}

impl From<SocketAddr> for EndpointAddress {
    fn from(socket: SocketAddr) -> Self {
        Self {
            host: AddressKind::Ip(socket.ip()),
            port: socket.port(),
        }
    }
}

impl From<(IpAddr, u16)> for EndpointAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(ip),
            port,
        }
    }
}

impl From<(Ipv4Addr, u16)> for EndpointAddress {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(IpAddr::V4(ip)),
            port,
        }
    }
}

impl From<([u8; 4], u16)> for EndpointAddress {
    fn from((ip, port): ([u8; 4], u16)) -> Self {
        Self {
            host: AddressKind::Ip(IpAddr::V4(ip.into())),
            port,
        }
    }
}

impl From<(Ipv6Addr, u16)> for EndpointAddress {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(IpAddr::V6(ip)),
            port,
        }
    }
}

impl From<(AddressKind, u16)> for EndpointAddress {
    fn from((host, port): (AddressKind, u16)) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let AddressKind::Ip(IpAddr::V6(ip)) = self.host {
            write!(f, "[{}]:{}", ip, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl<'de> Deserialize<'de> for EndpointAddress {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Accept borrowed or owned strings.
        let string = <std::borrow::Cow<'de, str>>::deserialize(de)?;
        string.parse::<Self>().map_err(serde::de::Error::custom)
    }
}

impl Serialize for EndpointAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl schemars::JsonSchema for EndpointAddress {
    fn schema_name() -> String {
        String::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_string() {
        let endpoint = "127.0.12.1:4567".parse::<EndpointAddress>().unwrap();
        match endpoint.host {
            AddressKind::Name(_) => panic!("Shouldn't be a name"),
            AddressKind::Ip(ip) => assert_eq!("127.0.12.1", ip.to_string()),
        };
        assert_eq!(4567, endpoint.port);

        let endpoint = "[2345:0425:2ca1:0000:0000:0567:5673:24b5]:25999"
            .parse::<EndpointAddress>()
            .unwrap();
        match endpoint.host {
            AddressKind::Name(_) => panic!("Shouldn't be a name"),
            AddressKind::Ip(ip) => assert_eq!("2345:425:2ca1::567:5673:24b5", ip.to_string()),
        };
        assert_eq!("[2345:425:2ca1::567:5673:24b5]:25999", endpoint.to_string());

        let endpoint = "tcp://backend.internal:8080"
            .parse::<EndpointAddress>()
            .unwrap();
        assert_eq!(
            AddressKind::Name("backend.internal".into()),
            endpoint.host
        );
        assert_eq!("backend.internal:8080", endpoint.to_string());
    }

    #[test]
    fn invalid_addresses() {
        assert!(matches!(
            "udp://127.0.0.1:80".parse::<EndpointAddress>(),
            Err(ParseError::UnsupportedScheme)
        ));
        assert!(matches!(
            "127.0.0.1".parse::<EndpointAddress>(),
            Err(ParseError::EmptyPort)
        ));
        assert!(matches!(
            "127.0.0.1:80/path".parse::<EndpointAddress>(),
            Err(ParseError::PathsNotAllowed)
        ));
    }

    #[test]
    fn with_port() {
        let address = EndpointAddress::from(([10, 0, 0, 1], 80));
        assert_eq!(address, address.with_port(0));
        assert_eq!(
            EndpointAddress::from(([10, 0, 0, 1], 8080)),
            address.with_port(8080)
        );
    }
}
