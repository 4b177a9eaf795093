mod client;
mod server;

pub use client::TlsClient;
pub use server::TlsServer;

use openssl::x509::X509;

use crate::error::{Result, TunnelError};

/// PEM inputs of a mutually authenticated TLS endpoint.
///
/// Every trust anchor bundle (root CA, intermediate CAs) is merged into one
/// pool. `cert_pem` holds the leaf first, optionally followed by its chain.
#[derive(Clone, Default)]
pub struct TlsMaterial {
    pub trust_anchors: Vec<Vec<u8>>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl TlsMaterial {
    pub fn new(trust_anchors: Vec<Vec<u8>>, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        TlsMaterial {
            trust_anchors,
            cert_pem,
            key_pem,
        }
    }

    /// All anchor certificates, in bundle order.
    pub fn anchor_pool(&self) -> Result<Vec<X509>> {
        let mut pool = Vec::new();
        for bundle in &self.trust_anchors {
            let certs = X509::stack_from_pem(bundle)?;
            if certs.is_empty() {
                return Err(TunnelError::InvalidMaterial(String::from("trust bundle holds no certificate")));
            }
            pool.extend(certs);
        }
        if pool.is_empty() {
            return Err(TunnelError::InvalidMaterial(String::from("no trust anchors")));
        }
        Ok(pool)
    }

    /// The leaf certificate followed by any chain certificates.
    pub fn cert_chain(&self) -> Result<Vec<X509>> {
        let chain = X509::stack_from_pem(&self.cert_pem)?;
        if chain.is_empty() {
            return Err(TunnelError::InvalidMaterial(String::from("no certificate in cert PEM")));
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("trust_anchors", &self.trust_anchors.len())
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}
