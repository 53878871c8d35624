//! Fingerprint normalization and display formatting
//!
//! Every identity is compared through its canonical fingerprint,
//! `sha256:<64 lowercase hex chars>`. Raw material (DER certificates, SSH
//! public key blobs) is hashed with SHA-256; fingerprints that the TLS/SSH
//! layer already computed are parsed and re-encoded in canonical form.

use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::trust::error::TrustError;
use crate::trust::hasher::sha256_digest;
use crate::trust::record::IdentityKind;

const PREFIX: &str = "sha256:";
const DIGEST_HEX_LEN: usize = 64;
/// Case-sensitive: the body is base64
const OPENSSH_PREFIX: &str = "SHA256:";
const OPENSSH_BASE64_LEN: usize = 43;
const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Shapes accepted for an already-computed fingerprint (after lowercasing
/// and stripping the `sha256:` prefix)
static FINGERPRINT_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9a-f]{64}|[0-9a-f]{2}(?::[0-9a-f]{2}){31}|[0-9a-f]{2}(?:-[0-9a-f]{2}){31}|[0-9a-f]{4}(?:-[0-9a-f]{4}){15})$",
    )
    .expect("fingerprint shape regex is valid")
});

/// Canonical fingerprint of one cryptographic identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a 32-byte SHA-256 digest
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Fingerprint(format!("{PREFIX}{}", hex::encode(digest)))
    }

    /// Parse an already-computed fingerprint.
    ///
    /// Accepts `sha256:<hex>`, bare hex, colon- or hyphen-delimited groups
    /// as produced by [`format_fingerprint`], and the OpenSSH
    /// `SHA256:<base64>` form.
    pub fn parse(input: &str) -> Result<Self, TrustError> {
        if let Some(encoded) = input
            .trim()
            .strip_prefix(OPENSSH_PREFIX)
            .filter(|body| body.len() == OPENSSH_BASE64_LEN)
        {
            return Self::parse_openssh(encoded);
        }

        let lowered = input.trim().to_ascii_lowercase();
        let body = lowered.strip_prefix(PREFIX).unwrap_or(&lowered);

        if body.is_empty() {
            return Err(TrustError::invalid("fingerprint is empty"));
        }
        if !FINGERPRINT_SHAPE.is_match(body) {
            return Err(TrustError::invalid(format!(
                "'{}' is not a SHA-256 fingerprint",
                input.trim()
            )));
        }

        let hex_digits: String = body.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        debug_assert_eq!(hex_digits.len(), DIGEST_HEX_LEN);
        Ok(Fingerprint(format!("{PREFIX}{hex_digits}")))
    }

    /// `ssh-keygen -l` form: unpadded standard base64 of the digest
    fn parse_openssh(encoded: &str) -> Result<Self, TrustError> {
        let digest = general_purpose::STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| TrustError::invalid(format!("OpenSSH fingerprint is not valid base64: {e}")))?;
        let digest: [u8; 32] = digest
            .try_into()
            .map_err(|_| TrustError::invalid("OpenSSH fingerprint is not a SHA-256 digest"))?;
        Ok(Self::from_digest(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digits without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[PREFIX.len()..]
    }

    /// Abbreviated form for logs and tables
    pub fn short(&self) -> &str {
        &self.0[..PREFIX.len() + 16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = TrustError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Hash raw identity material into its canonical fingerprint.
///
/// TLS material must be a single DER-encoded certificate; SSH material must
/// be a public key blob in SSH wire format. Anything else is
/// [`TrustError::InvalidIdentity`].
pub fn fingerprint_material(kind: IdentityKind, material: &[u8]) -> Result<Fingerprint, TrustError> {
    match kind {
        IdentityKind::Tls => check_der_certificate(material)?,
        IdentityKind::Ssh => check_ssh_key_blob(material)?,
    }
    Ok(Fingerprint::from_digest(&sha256_digest(material)))
}

fn check_der_certificate(material: &[u8]) -> Result<(), TrustError> {
    if material.len() < 2 {
        return Err(TrustError::invalid("certificate is truncated"));
    }
    if material[0] != 0x30 {
        return Err(TrustError::invalid("certificate is not a DER SEQUENCE"));
    }

    let first = material[1];
    let (header_len, content_len) = if first < 0x80 {
        (2usize, first as usize)
    } else {
        let len_bytes = (first & 0x7f) as usize;
        // 0x80 is BER indefinite length, never valid DER
        if len_bytes == 0 || len_bytes > 4 {
            return Err(TrustError::invalid("certificate has an invalid DER length"));
        }
        let header_len = 2 + len_bytes;
        if material.len() < header_len {
            return Err(TrustError::invalid("certificate is truncated"));
        }
        let content_len = material[2..header_len]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (header_len, content_len)
    };

    if header_len + content_len != material.len() {
        return Err(TrustError::invalid(format!(
            "certificate length mismatch: header declares {} bytes, got {}",
            header_len + content_len,
            material.len()
        )));
    }
    Ok(())
}

fn check_ssh_key_blob(material: &[u8]) -> Result<(), TrustError> {
    if material.len() < 4 {
        return Err(TrustError::invalid("SSH key blob is truncated"));
    }
    let name_len = u32::from_be_bytes([material[0], material[1], material[2], material[3]]) as usize;
    if name_len == 0 || name_len > 64 {
        return Err(TrustError::invalid("SSH key blob has an invalid algorithm name length"));
    }
    let name_end = 4 + name_len;
    if material.len() <= name_end {
        return Err(TrustError::invalid("SSH key blob has no key data"));
    }
    let name = &material[4..name_end];
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(TrustError::invalid("SSH key blob algorithm name is not printable"));
    }
    Ok(())
}

/// Turn the contents of a certificate or key file into raw material.
///
/// TLS accepts DER or a PEM `CERTIFICATE` block; SSH accepts a raw key
/// blob or an OpenSSH public key line (`ssh-ed25519 AAAA... comment`).
pub fn decode_material(kind: IdentityKind, contents: &[u8]) -> Result<Cow<'_, [u8]>, TrustError> {
    let Ok(text) = std::str::from_utf8(contents) else {
        return Ok(Cow::Borrowed(contents));
    };

    match kind {
        IdentityKind::Tls => {
            let Some(start) = text.find(PEM_BEGIN) else {
                return Ok(Cow::Borrowed(contents));
            };
            let body = &text[start + PEM_BEGIN.len()..];
            let end = body
                .find(PEM_END)
                .ok_or_else(|| TrustError::invalid("PEM certificate block is not terminated"))?;
            let encoded: String = body[..end].chars().filter(|c| !c.is_whitespace()).collect();
            general_purpose::STANDARD
                .decode(encoded)
                .map(Cow::Owned)
                .map_err(|e| TrustError::invalid(format!("PEM certificate is not valid base64: {e}")))
        }
        IdentityKind::Ssh => {
            let mut fields = text.split_whitespace();
            let (Some(algorithm), Some(encoded)) = (fields.next(), fields.next()) else {
                return Ok(Cow::Borrowed(contents));
            };
            if !algorithm.starts_with("ssh-") && !algorithm.starts_with("ecdsa-") && !algorithm.starts_with("sk-") {
                return Ok(Cow::Borrowed(contents));
            }
            let blob = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| TrustError::invalid(format!("SSH public key is not valid base64: {e}")))?;

            let declared = blob
                .get(4..)
                .zip(blob.get(..4))
                .and_then(|(rest, len)| {
                    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                    rest.get(..len)
                });
            if declared != Some(algorithm.as_bytes()) {
                return Err(TrustError::invalid(format!(
                    "SSH public key blob does not match its algorithm '{algorithm}'"
                )));
            }
            Ok(Cow::Owned(blob))
        }
    }
}

/// Delimiter style for human-readable fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintStyle {
    /// `AB:CD:EF:...`
    #[default]
    Colon,
    /// `ABCD-EF01-...`
    Hyphen,
}

impl FromStr for FingerprintStyle {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "colon" | ":" => Ok(FingerprintStyle::Colon),
            "hyphen" | "dash" | "-" => Ok(FingerprintStyle::Hyphen),
            other => Err(TrustError::invalid(format!("unknown fingerprint style '{other}'"))),
        }
    }
}

/// Render a fingerprint as grouped uppercase hex for display
pub fn format_fingerprint(fingerprint: &Fingerprint, style: FingerprintStyle) -> String {
    let (group, delimiter) = match style {
        FingerprintStyle::Colon => (2, ":"),
        FingerprintStyle::Hyphen => (4, "-"),
    };
    let upper = fingerprint.hex().to_ascii_uppercase();
    upper
        .as_bytes()
        .chunks(group)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn ssh_blob(name: &str, key: &[u8]) -> Vec<u8> {
        let mut blob = (name.len() as u32).to_be_bytes().to_vec();
        blob.extend_from_slice(name.as_bytes());
        blob.extend_from_slice(key);
        blob
    }

    #[test]
    fn test_parse_accepts_all_shapes() {
        let canonical = format!("sha256:{HEX}");
        let upper = HEX.to_ascii_uppercase();

        let inputs = vec![
            canonical.clone(),
            format!("SHA256:{upper}"),
            HEX.to_string(),
            format!("  {HEX}  "),
        ];
        for input in inputs {
            assert_eq!(Fingerprint::parse(&input).unwrap().as_str(), canonical);
        }

        let fp = Fingerprint::parse(HEX).unwrap();
        let colon = format_fingerprint(&fp, FingerprintStyle::Colon);
        let hyphen = format_fingerprint(&fp, FingerprintStyle::Hyphen);
        assert_eq!(Fingerprint::parse(&colon).unwrap(), fp);
        assert_eq!(Fingerprint::parse(&hyphen).unwrap(), fp);

        // ssh-keygen -l output
        let openssh = Fingerprint::parse("SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s").unwrap();
        assert_eq!(
            openssh.as_str(),
            "sha256:b8d895ced92c0ac0e171cd2ef5ef01ba3417554a4a6480d331ccc2be3ded0f6b"
        );
    }

    #[test]
    fn test_openssh_form_is_case_sensitive() {
        // Lowercasing base64 changes the digest; never treat it as the same key
        let lowered = Fingerprint::parse("SHA256:uniVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s").unwrap();
        assert_ne!(
            lowered.as_str(),
            "sha256:b8d895ced92c0ac0e171cd2ef5ef01ba3417554a4a6480d331ccc2be3ded0f6b"
        );

        let err = Fingerprint::parse("SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2!").unwrap_err();
        assert!(matches!(err, TrustError::InvalidIdentity { .. }));
        assert!(Fingerprint::parse("sha256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "sha256:",
            "sha256:xyz",
            &HEX[..62],
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "9F:86:D0",
            "FP_A",
        ] {
            assert!(
                matches!(Fingerprint::parse(bad), Err(TrustError::InvalidIdentity { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_format_colon_and_hyphen() {
        let fp = Fingerprint::parse(HEX).unwrap();
        let colon = format_fingerprint(&fp, FingerprintStyle::Colon);
        assert!(colon.starts_with("9F:86:D0:81"));
        assert_eq!(colon.split(':').count(), 32);

        let hyphen = format_fingerprint(&fp, FingerprintStyle::Hyphen);
        assert!(hyphen.starts_with("9F86-D081-884C"));
        assert_eq!(hyphen.split('-').count(), 16);
    }

    #[test]
    fn test_short_form() {
        let fp = Fingerprint::parse(HEX).unwrap();
        assert_eq!(fp.short(), "sha256:9f86d081884c7d65");
    }

    #[test]
    fn test_material_is_deterministic() {
        let blob = ssh_blob("ssh-ed25519", &[7u8; 32]);
        let a = fingerprint_material(IdentityKind::Ssh, &blob).unwrap();
        let b = fingerprint_material(IdentityKind::Ssh, &blob).unwrap();
        assert_eq!(a, b);

        let other = ssh_blob("ssh-ed25519", &[8u8; 32]);
        assert_ne!(a, fingerprint_material(IdentityKind::Ssh, &other).unwrap());
    }

    #[test]
    fn test_ssh_blob_validation() {
        assert!(fingerprint_material(IdentityKind::Ssh, b"").is_err());
        assert!(fingerprint_material(IdentityKind::Ssh, &ssh_blob("ssh-rsa", &[])).is_err());
        assert!(fingerprint_material(IdentityKind::Ssh, &ssh_blob("bad name", &[1])).is_err());
        let mut lying = ssh_blob("ssh-rsa", &[1, 2, 3]);
        lying[3] = 200;
        assert!(fingerprint_material(IdentityKind::Ssh, &lying).is_err());
    }

    #[test]
    fn test_der_validation() {
        // short form length
        let short = [0x30, 0x03, 0x02, 0x01, 0x05];
        assert!(fingerprint_material(IdentityKind::Tls, &short).is_ok());

        // long form length (0x81 0x80 = 128 content bytes)
        let mut long = vec![0x30, 0x81, 0x80];
        long.extend(std::iter::repeat(0u8).take(128));
        assert!(fingerprint_material(IdentityKind::Tls, &long).is_ok());

        assert!(fingerprint_material(IdentityKind::Tls, &[0x30]).is_err());
        assert!(fingerprint_material(IdentityKind::Tls, &[0x31, 0x00]).is_err());
        assert!(fingerprint_material(IdentityKind::Tls, &[0x30, 0x80, 0x00, 0x00]).is_err());
        assert!(fingerprint_material(IdentityKind::Tls, &[0x30, 0x05, 0x00]).is_err());
    }

    #[test]
    fn test_decode_openssh_public_key_line() {
        let blob = ssh_blob("ssh-ed25519", &[9u8; 32]);
        let line = format!("ssh-ed25519 {} admin@host\n", general_purpose::STANDARD.encode(&blob));

        let decoded = decode_material(IdentityKind::Ssh, line.as_bytes()).unwrap();
        assert_eq!(decoded.as_ref(), blob.as_slice());

        let mismatched = format!("ssh-rsa {}", general_purpose::STANDARD.encode(&blob));
        assert!(decode_material(IdentityKind::Ssh, mismatched.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_pem_certificate() {
        let der = [0x30, 0x03, 0x02, 0x01, 0x05];
        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            general_purpose::STANDARD.encode(der)
        );

        let decoded = decode_material(IdentityKind::Tls, pem.as_bytes()).unwrap();
        assert_eq!(decoded.as_ref(), &der);
        assert!(fingerprint_material(IdentityKind::Tls, &decoded).is_ok());

        // Binary input passes through untouched
        let raw = [0x30, 0x81, 0xff];
        assert_eq!(decode_material(IdentityKind::Tls, &raw).unwrap().as_ref(), &raw);
    }

    #[test]
    fn test_serde_rejects_non_canonical_garbage() {
        let parsed: Result<Fingerprint, _> = serde_json::from_str("\"not-a-fingerprint\"");
        assert!(parsed.is_err());

        let parsed: Fingerprint = serde_json::from_str(&format!("\"{}\"", HEX.to_uppercase())).unwrap();
        assert_eq!(parsed.as_str(), format!("sha256:{HEX}"));
    }
}
