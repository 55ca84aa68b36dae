//! Certificate generation.
//!
//! The assembly carries one cluster CA and a certificate per replica, signed
//! by that CA. [`CertManager`] hides how they are produced; the operator uses
//! [`RcgenCertManager`], tests can plug in something cheaper.

use crate::error::OperatorResult;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

/// PEM certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertAndKey {
    /// Certificate, PEM.
    pub cert_pem: String,
    /// Private key, PEM.
    pub key_pem: String,
}

/// Produces CA and leaf certificates.
pub trait CertManager: Send + Sync {
    /// Self-signed CA certificate.
    fn generate_ca(&self, common_name: &str) -> OperatorResult<CertAndKey>;

    /// Leaf certificate for `common_name` and `sans`, signed by `ca`.
    fn generate_signed(
        &self,
        ca: &CertAndKey,
        common_name: &str,
        sans: &[String],
    ) -> OperatorResult<CertAndKey>;
}

/// [`CertManager`] backed by `rcgen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenCertManager;

const ORGANIZATION: &str = "quorum.io";

impl CertManager for RcgenCertManager {
    fn generate_ca(&self, common_name: &str) -> OperatorResult<CertAndKey> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, common_name);

        let mut params = CertificateParams::new(Vec::<String>::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::CrlSign, KeyUsagePurpose::KeyCertSign];

        let cert = Certificate::from_params(params)?;
        Ok(CertAndKey {
            cert_pem: cert.serialize_pem()?,
            key_pem: cert.serialize_private_key_pem(),
        })
    }

    fn generate_signed(
        &self,
        ca: &CertAndKey,
        common_name: &str,
        sans: &[String],
    ) -> OperatorResult<CertAndKey> {
        let ca_key = KeyPair::from_pem(&ca.key_pem)?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem, ca_key)?;
        let ca_cert = Certificate::from_params(ca_params)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, common_name);

        let mut params = CertificateParams::new(sans.to_vec());
        params.distinguished_name = dn;
        let cert = Certificate::from_params(params)?;

        Ok(CertAndKey {
            cert_pem: cert.serialize_pem_with_signer(&ca_cert)?,
            key_pem: cert.serialize_private_key_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_leaf_with_generated_ca() {
        let manager = RcgenCertManager;
        let ca = manager.generate_ca("cluster-ca").expect("ca");
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let leaf = manager
            .generate_signed(&ca, "a-ensemble-0", &["a-ensemble-0.a-ensemble-headless".into()])
            .expect("leaf");
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
        assert_ne!(leaf.cert_pem, ca.cert_pem);
    }
}
