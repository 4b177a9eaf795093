use std::fmt;

use url::{form_urlencoded, Url};

use crate::error::{Result, TunnelError};

pub const NETWORK_PARAM: &str = "network";
pub const ADDRESS_PARAM: &str = "address";

/// Where the relay should connect on behalf of a tunneled session.
///
/// Travels as the `network` and `address` query parameters of the channel
/// upgrade request and never changes once the tunnel is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub network: String,
    pub address: String,
}

impl Destination {
    pub fn new(network: &str, address: &str) -> Self {
        Destination {
            network: network.to_owned(),
            address: address.to_owned(),
        }
    }

    /// Parses the destination out of a raw query string. The first occurrence
    /// of each parameter wins; missing or empty values are a bad request.
    pub fn from_query(query: Option<&str>) -> Result<Self> {
        let mut network = None;
        let mut address = None;
        for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                NETWORK_PARAM if network.is_none() => network = Some(value.into_owned()),
                ADDRESS_PARAM if address.is_none() => address = Some(value.into_owned()),
                _ => {}
            }
        }
        let dest = Destination {
            network: network.unwrap_or_default(),
            address: address.unwrap_or_default(),
        };
        dest.validate()?;
        Ok(dest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.is_empty() || self.address.is_empty() {
            return Err(TunnelError::BadRequest(String::from(
                "missing 'network' or 'address' query parameters",
            )));
        }
        Ok(())
    }

    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair(NETWORK_PARAM, &self.network)
            .append_pair(ADDRESS_PARAM, &self.address)
            .finish()
    }

    /// Builds the channel URL for `endpoint` (e.g. `ws://localhost:8080/ws`)
    /// with this destination attached as query parameters.
    pub fn channel_url(&self, endpoint: &str) -> Result<Url> {
        let mut url = Url::parse(endpoint).map_err(|e| TunnelError::UpgradeFailed(format!("invalid endpoint {}: {}", endpoint, e)))?;
        if url.scheme() != "ws" {
            return Err(TunnelError::UpgradeFailed(format!("unsupported endpoint scheme: {}", url.scheme())));
        }
        url.query_pairs_mut()
            .append_pair(NETWORK_PARAM, &self.network)
            .append_pair(ADDRESS_PARAM, &self.address);
        Ok(url)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.address)
    }
}

/// Synthetic address of a tunneled endpoint. It names the destination for
/// display purposes only and is not a routable socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddr {
    address: String,
}

impl TunnelAddr {
    pub const NETWORK: &'static str = "websocket";

    pub fn new(address: &str) -> Self {
        TunnelAddr { address: address.to_owned() }
    }

    pub fn network(&self) -> &str {
        Self::NETWORK
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", Self::NETWORK, self.address)
    }
}
