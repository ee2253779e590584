//! Pluggable DTLS identity verification.
//!
//! Some cameras still present X.509 v1 certificates, which stricter
//! parsers reject outright. Rather than patching a library internal, the
//! negotiation layer composes a verification strategy selected by a
//! certificate format probe:
//!
//! - `ModernVerifier`: certificates with an explicit version field are
//!   checked against the advertised fingerprint of the matching digest
//!   algorithm.
//! - `LegacyFingerprintVerifier`: v1 certificates fall back to comparing
//!   the certificate digest against every advertised transport
//!   fingerprint, accepting on the first match and failing the session
//!   only when none match.
//!
//! A validation miss marks the session failed; it never aborts the engine.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// One advertised transport fingerprint, as carried in an SDP
/// `a=fingerprint:<algorithm> <hex:hex:...>` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

/// Peer identity material gathered during negotiation.
#[derive(Clone, Debug)]
pub struct PeerParameters {
    /// DER-encoded peer certificate.
    pub certificate_der: Vec<u8>,
    /// Fingerprints advertised in the remote session description.
    pub fingerprints: Vec<Fingerprint>,
}

/// Capability-set interface: validate a peer or fail.
pub trait IdentityVerifier: Send + Sync {
    fn validate(&self, peer: &PeerParameters) -> Result<()>;
}

/// Strict path for certificates with an explicit X.509 version field.
///
/// The digest is computed with the algorithm named by the advertised
/// fingerprint; an algorithm we cannot compute is skipped, a computed
/// mismatch is a hard failure.
pub struct ModernVerifier;

impl IdentityVerifier for ModernVerifier {
    fn validate(&self, peer: &PeerParameters) -> Result<()> {
        let mut compared = 0usize;
        for fingerprint in &peer.fingerprints {
            let Some(digest) = digest_for(&fingerprint.algorithm, &peer.certificate_der) else {
                continue;
            };
            compared += 1;
            if digest != normalize(&fingerprint.value) {
                return Err(anyhow!(
                    "certificate digest mismatch for {}",
                    fingerprint.algorithm
                ));
            }
        }
        if compared == 0 {
            return Err(anyhow!("no advertised fingerprint uses a supported digest"));
        }
        Ok(())
    }
}

/// Legacy path for v1 certificates: compare against all advertised
/// fingerprints, first match wins.
pub struct LegacyFingerprintVerifier;

impl IdentityVerifier for LegacyFingerprintVerifier {
    fn validate(&self, peer: &PeerParameters) -> Result<()> {
        for fingerprint in &peer.fingerprints {
            let Some(digest) = digest_for(&fingerprint.algorithm, &peer.certificate_der) else {
                continue;
            };
            if digest == normalize(&fingerprint.value) {
                return Ok(());
            }
        }
        Err(anyhow!(
            "certificate digest matched none of {} advertised fingerprints",
            peer.fingerprints.len()
        ))
    }
}

/// Pick the verification strategy by probing the certificate encoding.
pub fn select_verifier(certificate_der: &[u8]) -> Box<dyn IdentityVerifier> {
    if has_explicit_version(certificate_der) {
        Box::new(ModernVerifier)
    } else {
        Box::new(LegacyFingerprintVerifier)
    }
}

/// DER probe: an X.509 v2/v3 certificate carries an explicit
/// context-tagged version (`[0]`) as the first TBSCertificate element;
/// v1 omits it and starts straight at the serial number.
fn has_explicit_version(der: &[u8]) -> bool {
    // Outer SEQUENCE, then the TBSCertificate SEQUENCE.
    let Some(outer) = skip_der_header(der) else {
        return false;
    };
    let Some(tbs) = skip_der_header(outer) else {
        return false;
    };
    tbs.first() == Some(&0xA0)
}

/// Step over one DER tag/length header, returning the content bytes.
fn skip_der_header(bytes: &[u8]) -> Option<&[u8]> {
    let (&tag, rest) = bytes.split_first()?;
    if tag != 0x30 {
        return None;
    }
    let (&len, rest) = rest.split_first()?;
    if len & 0x80 == 0 {
        return Some(rest);
    }
    let len_octets = (len & 0x7F) as usize;
    if rest.len() < len_octets {
        return None;
    }
    Some(&rest[len_octets..])
}

fn digest_for(algorithm: &str, der: &[u8]) -> Option<String> {
    let digest = match algorithm.to_ascii_lowercase().as_str() {
        "sha-256" | "sha256" => Sha256::digest(der).to_vec(),
        "sha-384" | "sha384" => Sha384::digest(der).to_vec(),
        "sha-512" | "sha512" => Sha512::digest(der).to_vec(),
        _ => return None,
    };
    Some(hex::encode(digest))
}

/// Strip colon separators and lowercase, the format fingerprints are
/// advertised in.
fn normalize(value: &str) -> String {
    value.replace(':', "").to_ascii_lowercase()
}

/// Collect `a=fingerprint:` attributes from a session description.
pub(crate) fn parse_sdp_fingerprints(sdp: &str) -> Vec<Fingerprint> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("a=fingerprint:"))
        .filter_map(|rest| {
            let mut parts = rest.splitn(2, ' ');
            let algorithm = parts.next()?.trim().to_string();
            let value = parts.next()?.trim().to_string();
            if algorithm.is_empty() || value.is_empty() {
                None
            } else {
                Some(Fingerprint { algorithm, value })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal DER skeletons: outer SEQUENCE wrapping a TBS SEQUENCE whose
    // first element either is the [0] version tag (v3) or an INTEGER
    // serial (v1).
    fn v3_cert() -> Vec<u8> {
        vec![0x30, 0x0A, 0x30, 0x08, 0xA0, 0x03, 0x02, 0x01, 0x02, 0x02, 0x01, 0x01]
    }

    fn v1_cert() -> Vec<u8> {
        vec![0x30, 0x07, 0x30, 0x05, 0x02, 0x01, 0x01, 0x02, 0x00]
    }

    fn colon_hex(digest: &str) -> String {
        digest
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap().to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn params(der: Vec<u8>, fingerprints: Vec<Fingerprint>) -> PeerParameters {
        PeerParameters {
            certificate_der: der,
            fingerprints,
        }
    }

    #[test]
    fn probe_selects_path_by_version_encoding() {
        assert!(has_explicit_version(&v3_cert()));
        assert!(!has_explicit_version(&v1_cert()));
    }

    #[test]
    fn modern_verifier_matches_algorithm_specific_digest() {
        let der = v3_cert();
        let digest = digest_for("sha-256", &der).unwrap();
        let peer = params(
            der,
            vec![Fingerprint {
                algorithm: "sha-256".to_string(),
                value: colon_hex(&digest),
            }],
        );
        assert!(ModernVerifier.validate(&peer).is_ok());
    }

    #[test]
    fn modern_verifier_rejects_mismatch() {
        let peer = params(
            v3_cert(),
            vec![Fingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        );
        assert!(ModernVerifier.validate(&peer).is_err());
    }

    #[test]
    fn legacy_verifier_accepts_first_match_among_many() {
        let der = v1_cert();
        let digest = digest_for("sha-256", &der).unwrap();
        let peer = params(
            der,
            vec![
                Fingerprint {
                    algorithm: "sha-384".to_string(),
                    value: "00:11:22".to_string(),
                },
                Fingerprint {
                    algorithm: "sha-256".to_string(),
                    value: colon_hex(&digest),
                },
            ],
        );
        assert!(LegacyFingerprintVerifier.validate(&peer).is_ok());
    }

    #[test]
    fn legacy_verifier_fails_only_when_nothing_matches() {
        let peer = params(
            v1_cert(),
            vec![Fingerprint {
                algorithm: "sha-256".to_string(),
                value: "00:11:22:33".to_string(),
            }],
        );
        assert!(LegacyFingerprintVerifier.validate(&peer).is_err());
    }

    #[test]
    fn sdp_fingerprint_lines_are_collected() {
        let sdp = "v=0\r\n\
                   a=fingerprint:sha-256 AA:BB:CC:DD\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=fingerprint:sha-384 11:22:33\r\n";
        let fingerprints = parse_sdp_fingerprints(sdp);
        assert_eq!(fingerprints.len(), 2);
        assert_eq!(fingerprints[0].algorithm, "sha-256");
        assert_eq!(fingerprints[1].value, "11:22:33");
    }
}
