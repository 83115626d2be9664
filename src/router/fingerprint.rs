//! Listener configuration fingerprint.
//!
//! Every field that requires relistening when it changes is fed to SHA-256
//! with a length prefix, so no two field sequences collide by concatenation.

use sha2::{Digest, Sha256};

use crate::config::RouterSettings;
use crate::store::{Certificate, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    digest: [u8; 32],
    certificates: [u8; 32],
}

impl Fingerprint {
    pub fn compute(node: &Node, settings: &RouterSettings, certificates: &[Certificate]) -> Self {
        let mut hasher = Sha256::new();

        let roles: Vec<&str> = node.roles.iter().map(|r| r.as_str()).collect();
        field(&mut hasher, roles.join(",").as_bytes());
        field(&mut hasher, node.management_domain.as_bytes());
        field(&mut hasher, node.user_domain.as_bytes());
        field(&mut hasher, &node.listen_port().to_be_bytes());
        field(&mut hasher, &[u8::from(node.no_redirect_server)]);
        field(&mut hasher, &settings.redirect_port.to_be_bytes());
        field(&mut hasher, node.listen_protocol().as_str().as_bytes());

        field(&mut hasher, &settings.read_timeout_secs.to_be_bytes());
        field(&mut hasher, &settings.read_header_timeout_secs.to_be_bytes());
        field(&mut hasher, &settings.write_timeout_secs.to_be_bytes());
        field(&mut hasher, &settings.idle_timeout_secs.to_be_bytes());

        let mut certs = Sha256::new();
        for cert in certificates {
            field(&mut certs, cert.content_hash().as_bytes());
        }
        let certificates: [u8; 32] = certs.finalize().into();
        hasher.update(certificates);

        Self {
            digest: hasher.finalize().into(),
            certificates,
        }
    }

    /// The certificate set differs between the two fingerprints.
    pub fn certificates_changed(&self, other: &Fingerprint) -> bool {
        self.certificates != other.certificates
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;

    fn node() -> Node {
        toml::from_str(
            r#"
            id = "n1"
            roles = ["management", "proxy"]
            management_domain = "admin.example.com"
            "#,
        )
        .unwrap()
    }

    fn cert(key: &str) -> Certificate {
        Certificate {
            id: "c1".into(),
            name: String::new(),
            certificate: "CERT".into(),
            key: key.into(),
        }
    }

    #[test]
    fn stable_without_change() {
        let settings = RouterSettings::default();
        let a = Fingerprint::compute(&node(), &settings, &[cert("k")]);
        let b = Fingerprint::compute(&node(), &settings, &[cert("k")]);
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn every_tracked_field_changes_it() {
        let settings = RouterSettings::default();
        let base = Fingerprint::compute(&node(), &settings, &[cert("k")]);

        let mut n = node();
        n.roles = vec![Role::Proxy];
        assert_ne!(base, Fingerprint::compute(&n, &settings, &[cert("k")]));

        let mut n = node();
        n.user_domain = "user.example.com".into();
        assert_ne!(base, Fingerprint::compute(&n, &settings, &[cert("k")]));

        let mut n = node();
        n.port = 8443;
        assert_ne!(base, Fingerprint::compute(&n, &settings, &[cert("k")]));

        let mut n = node();
        n.no_redirect_server = true;
        assert_ne!(base, Fingerprint::compute(&n, &settings, &[cert("k")]));

        let mut n = node();
        n.protocol = Some(crate::store::Protocol::Http);
        assert_ne!(base, Fingerprint::compute(&n, &settings, &[cert("k")]));

        let mut s = RouterSettings::default();
        s.idle_timeout_secs += 1;
        assert_ne!(base, Fingerprint::compute(&node(), &s, &[cert("k")]));
    }

    #[test]
    fn certificate_changes_are_reported() {
        let settings = RouterSettings::default();
        let a = Fingerprint::compute(&node(), &settings, &[cert("k")]);
        let b = Fingerprint::compute(&node(), &settings, &[cert("k2")]);
        assert_ne!(a, b);
        assert!(a.certificates_changed(&b));

        let mut n = node();
        n.user_domain = "user.example.com".into();
        let c = Fingerprint::compute(&n, &settings, &[cert("k")]);
        assert!(!a.certificates_changed(&c));
    }

    #[test]
    fn field_boundaries_matter() {
        let settings = RouterSettings::default();
        let mut a = node();
        a.management_domain = "ab".into();
        a.user_domain = "c".into();
        let mut b = node();
        b.management_domain = "a".into();
        b.user_domain = "bc".into();
        assert_ne!(
            Fingerprint::compute(&a, &settings, &[]),
            Fingerprint::compute(&b, &settings, &[])
        );
    }
}
