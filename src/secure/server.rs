use std::io::{Read, Write};

use log::debug;
use openssl::pkey::PKey;
use openssl::ssl::{HandshakeError, SslAcceptor, SslMethod, SslStream, SslVerifyMode};

use super::TlsMaterial;
use crate::error::{Result, TunnelError};

/// Server side of mutual TLS: a verified client certificate is mandatory.
pub struct TlsServer {
    acceptor: SslAcceptor,
}

impl TlsServer {
    pub fn new(material: &TlsMaterial) -> Result<Self> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

        let mut chain = material.cert_chain()?.into_iter();
        if let Some(leaf) = chain.next() {
            builder.set_certificate(&leaf)?;
        }
        for cert in chain {
            builder.add_extra_chain_cert(cert)?;
        }
        let key = PKey::private_key_from_pem(&material.key_pem)?;
        builder.set_private_key(&key)?;
        builder.check_private_key()?;

        for anchor in material.anchor_pool()? {
            builder.add_client_ca(&anchor)?;
            builder.cert_store_mut().add_cert(anchor)?;
        }
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);

        Ok(TlsServer {
            acceptor: builder.build(),
        })
    }

    pub fn accept<S: Read + Write>(&self, stream: S) -> Result<SslStream<S>> {
        match self.acceptor.accept(stream) {
            Ok(tls) => {
                debug!("tls: client verified");
                Ok(tls)
            }
            Err(HandshakeError::SetupFailure(e)) => Err(TunnelError::HandshakeFailed(e.to_string())),
            Err(HandshakeError::Failure(mid)) => Err(TunnelError::HandshakeFailed(mid.error().to_string())),
            Err(HandshakeError::WouldBlock(_)) => {
                Err(TunnelError::HandshakeFailed(String::from("handshake interrupted")))
            }
        }
    }
}
