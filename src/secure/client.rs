use std::io::{Read, Write};

use log::debug;
use native_tls::{Certificate, HandshakeError, Identity, Protocol, TlsConnector, TlsStream};
use openssl::pkey::PKey;

use super::TlsMaterial;
use crate::error::{Result, TunnelError};

/// Client side of mutual TLS over any byte stream, a tunneled connection
/// included. Only the supplied anchors are trusted.
pub struct TlsClient {
    connector: TlsConnector,
    server_name: String,
}

impl TlsClient {
    pub fn new(material: &TlsMaterial, server_name: &str) -> Result<Self> {
        let mut builder = TlsConnector::builder();
        builder.disable_built_in_roots(true);
        builder.min_protocol_version(Some(Protocol::Tlsv12));
        for anchor in material.anchor_pool()? {
            builder.add_root_certificate(Certificate::from_der(&anchor.to_der()?)?);
        }

        // native-tls only takes PKCS#8 keys
        let key = PKey::private_key_from_pem(&material.key_pem)?.private_key_to_pem_pkcs8()?;
        builder.identity(Identity::from_pkcs8(&material.cert_pem, &key)?);

        Ok(TlsClient {
            connector: builder.build()?,
            server_name: server_name.to_owned(),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Runs the handshake over `stream`. Any failure, verification included,
    /// is fatal for this stream.
    pub fn connect<S: Read + Write>(&self, stream: S) -> Result<TlsStream<S>> {
        match self.connector.connect(&self.server_name, stream) {
            Ok(tls) => {
                debug!("tls: handshake with {} done", self.server_name);
                Ok(tls)
            }
            Err(HandshakeError::Failure(e)) => Err(TunnelError::HandshakeFailed(e.to_string())),
            Err(HandshakeError::WouldBlock(_)) => {
                Err(TunnelError::HandshakeFailed(String::from("handshake interrupted")))
            }
        }
    }
}
