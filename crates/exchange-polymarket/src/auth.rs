//! CLOB authentication for Polymarket.
//!
//! Two schemes, run in sequence at startup:
//!
//! 1. **L1**: sign a `ClobAuth` EIP-712 attestation with the EOA private
//!    key and call `GET /auth/derive-api-key` to obtain L2 credentials.
//!    Derivation that returns an empty key, secret, or passphrase is
//!    rejected outright.
//! 2. **L2**: HMAC-SHA256 over `timestamp + method + path + body` with the
//!    derived secret, shipped in `POLY_*` headers on authenticated calls.
//!
//! Book reads need no signature; the WS handshake sends an empty `auth`
//! object.

use base64::engine::general_purpose::URL_SAFE as BASE64_URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use k256::ecdsa::SigningKey;
use pm_arb_core::{PlatformError, PlatformResult};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Attestation message fixed by the CLOB.
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";
/// EIP-712 domain name for ClobAuth.
const CLOB_DOMAIN_NAME: &str = "ClobAuthDomain";
/// EIP-712 domain version.
const CLOB_DOMAIN_VERSION: &str = "1";
/// Polygon mainnet chain id.
const POLYGON_CHAIN_ID: u64 = 137;

fn keccak(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

// =============================================================================
// EOA key handling
// =============================================================================

/// The signer's EOA key and derived address.
pub struct EoaSigner {
    signing_key: SigningKey,
    address: String,
}

impl std::fmt::Debug for EoaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EoaSigner")
            .field("address", &self.address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl EoaSigner {
    /// Builds a signer from a hex-encoded private key (with or without the
    /// `0x` prefix).
    ///
    /// # Errors
    ///
    /// `Unauthorized` on malformed key material.
    pub fn from_private_key(private_key_hex: &SecretString) -> PlatformResult<Self> {
        let raw = private_key_hex.expose_secret();
        let stripped = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(stripped)
            .map_err(|e| PlatformError::Unauthorized(format!("bad private key hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| PlatformError::Unauthorized(format!("bad private key: {e}")))?;
        let address = derive_address(&signing_key);
        Ok(Self {
            signing_key,
            address,
        })
    }

    /// Loads the key from the given environment variable.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when the variable is missing or malformed.
    pub fn from_env(private_key_env: &str) -> PlatformResult<Self> {
        let raw = std::env::var(private_key_env).map_err(|_| {
            PlatformError::Unauthorized(format!(
                "missing environment variable: {private_key_env}"
            ))
        })?;
        Self::from_private_key(&SecretString::from(raw))
    }

    /// The 0x-prefixed lowercase address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Signs a 32-byte hash, returning the 65-byte `r||s||v` signature as
    /// 0x-prefixed hex with `v` in {27, 28}.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when signing fails.
    pub fn sign_hash(&self, hash: &[u8; 32]) -> PlatformResult<String> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|e| PlatformError::Unauthorized(format!("signing failed: {e}")))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(27 + recovery_id.to_byte());
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

/// Derives the 0x-prefixed address from a secp256k1 key.
fn derive_address(key: &SigningKey) -> String {
    let public = key.verifying_key().to_encoded_point(false);
    // Skip the 0x04 uncompressed-point tag.
    let hash = keccak(&public.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

// =============================================================================
// L1 attestation (EIP-712 ClobAuth)
// =============================================================================

/// Headers for L1 (attestation) authenticated requests.
#[derive(Debug, Clone)]
pub struct L1Headers {
    /// POLY_ADDRESS value.
    pub address: String,
    /// POLY_SIGNATURE value.
    pub signature: String,
    /// POLY_TIMESTAMP value (unix seconds).
    pub timestamp: String,
    /// POLY_NONCE value.
    pub nonce: String,
}

fn domain_separator() -> [u8; 32] {
    let type_hash = keccak(b"EIP712Domain(string name,string version,uint256 chainId)");
    let mut encoded = Vec::with_capacity(4 * 32);
    encoded.extend_from_slice(&type_hash);
    encoded.extend_from_slice(&keccak(CLOB_DOMAIN_NAME.as_bytes()));
    encoded.extend_from_slice(&keccak(CLOB_DOMAIN_VERSION.as_bytes()));
    let mut chain_id = [0u8; 32];
    chain_id[24..].copy_from_slice(&POLYGON_CHAIN_ID.to_be_bytes());
    encoded.extend_from_slice(&chain_id);
    keccak(&encoded)
}

fn clob_auth_struct_hash(address: &str, timestamp: &str, nonce: u64) -> PlatformResult<[u8; 32]> {
    let type_hash =
        keccak(b"ClobAuth(address address,string timestamp,uint256 nonce,string message)");
    let addr_bytes = hex::decode(address.strip_prefix("0x").unwrap_or(address))
        .map_err(|e| PlatformError::Unauthorized(format!("bad address: {e}")))?;
    if addr_bytes.len() != 20 {
        return Err(PlatformError::Unauthorized("address must be 20 bytes".into()));
    }

    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(&type_hash);
    let mut addr_padded = [0u8; 32];
    addr_padded[12..].copy_from_slice(&addr_bytes);
    encoded.extend_from_slice(&addr_padded);
    encoded.extend_from_slice(&keccak(timestamp.as_bytes()));
    let mut nonce_bytes = [0u8; 32];
    nonce_bytes[24..].copy_from_slice(&nonce.to_be_bytes());
    encoded.extend_from_slice(&nonce_bytes);
    encoded.extend_from_slice(&keccak(CLOB_AUTH_MESSAGE.as_bytes()));
    Ok(keccak(&encoded))
}

/// Signs the ClobAuth attestation for L1 authentication.
///
/// # Errors
///
/// `Unauthorized` when the clock is unreadable or signing fails.
pub fn sign_clob_auth(signer: &EoaSigner, nonce: u64) -> PlatformResult<L1Headers> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| PlatformError::Unauthorized(format!("failed to read clock: {e}")))?
        .as_secs()
        .to_string();

    let struct_hash = clob_auth_struct_hash(signer.address(), &timestamp, nonce)?;
    let domain = domain_separator();

    let mut preimage = Vec::with_capacity(2 + 64);
    preimage.extend_from_slice(&[0x19, 0x01]);
    preimage.extend_from_slice(&domain);
    preimage.extend_from_slice(&struct_hash);
    let signing_hash = keccak(&preimage);

    Ok(L1Headers {
        address: signer.address().to_string(),
        signature: signer.sign_hash(&signing_hash)?,
        timestamp,
        nonce: nonce.to_string(),
    })
}

// =============================================================================
// Credential derivation
// =============================================================================

/// L2 API credentials returned by the CLOB.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCredentials {
    /// API key identifier.
    pub api_key: String,
    /// Base64url-encoded HMAC secret.
    pub secret: String,
    /// Passphrase for the key.
    pub passphrase: String,
}

impl ApiCredentials {
    /// Rejects credential triples with any empty component.
    ///
    /// # Errors
    ///
    /// `CredentialDerivation` naming the empty field.
    pub fn validate(&self) -> PlatformResult<()> {
        for (name, value) in [
            ("apiKey", &self.api_key),
            ("secret", &self.secret),
            ("passphrase", &self.passphrase),
        ] {
            if value.is_empty() {
                return Err(PlatformError::CredentialDerivation(format!(
                    "derivation returned empty {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Error envelope the CLOB returns in place of a failure status.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<String>,
    #[allow(dead_code)]
    status: Option<u16>,
}

/// Derives L2 credentials via `GET /auth/derive-api-key` with L1 headers.
///
/// # Errors
///
/// `CredentialDerivation` on empty credentials or an error envelope;
/// platform taxonomy for transport failures.
pub async fn derive_api_key(
    http: &reqwest::Client,
    base_url: &str,
    signer: &EoaSigner,
) -> PlatformResult<ApiCredentials> {
    let headers = sign_clob_auth(signer, 0)?;
    let url = format!("{base_url}/auth/derive-api-key");

    let response = http
        .get(&url)
        .header("POLY_ADDRESS", &headers.address)
        .header("POLY_SIGNATURE", &headers.signature)
        .header("POLY_TIMESTAMP", &headers.timestamp)
        .header("POLY_NONCE", &headers.nonce)
        .send()
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| PlatformError::Network(e.to_string()))?;

    if !status.is_success() {
        return Err(PlatformError::CredentialDerivation(format!(
            "HTTP {status}: {text}"
        )));
    }
    // The CLOB sometimes returns {error, status} with a 200.
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
        if let Some(error) = envelope.error {
            return Err(PlatformError::CredentialDerivation(error));
        }
    }

    let creds: ApiCredentials = serde_json::from_str(&text)
        .map_err(|e| PlatformError::CredentialDerivation(format!("malformed response: {e}")))?;
    creds.validate()?;
    Ok(creds)
}

// =============================================================================
// L2 authentication (HMAC-SHA256)
// =============================================================================

/// HMAC signer for authenticated CLOB calls.
#[derive(Clone)]
pub struct L2Auth {
    credentials: ApiCredentials,
    address: String,
}

impl std::fmt::Debug for L2Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2Auth")
            .field("address", &self.address)
            .field("api_key", &self.credentials.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Headers for L2 (HMAC) authenticated requests.
#[derive(Debug, Clone)]
pub struct L2Headers {
    /// POLY_ADDRESS value.
    pub address: String,
    /// POLY_SIGNATURE value (base64url HMAC).
    pub signature: String,
    /// POLY_TIMESTAMP value (unix seconds).
    pub timestamp: String,
    /// POLY_API_KEY value.
    pub api_key: String,
    /// POLY_PASSPHRASE value.
    pub passphrase: String,
}

impl L2Auth {
    /// Creates an L2 signer from validated credentials.
    ///
    /// # Errors
    ///
    /// `CredentialDerivation` when the triple has an empty component.
    pub fn new(credentials: ApiCredentials, address: String) -> PlatformResult<Self> {
        credentials.validate()?;
        Ok(Self {
            credentials,
            address,
        })
    }

    /// Signs a request at the current time.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when the secret fails to decode or the clock is
    /// unreadable.
    pub fn headers(&self, method: &str, path: &str, body: &str) -> PlatformResult<L2Headers> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PlatformError::Unauthorized(format!("failed to read clock: {e}")))?
            .as_secs()
            .to_string();
        self.headers_with_timestamp(method, path, body, &timestamp)
    }

    fn headers_with_timestamp(
        &self,
        method: &str,
        path: &str,
        body: &str,
        timestamp: &str,
    ) -> PlatformResult<L2Headers> {
        let secret = BASE64_URL_SAFE
            .decode(&self.credentials.secret)
            .map_err(|e| PlatformError::Unauthorized(format!("bad HMAC secret: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| PlatformError::Unauthorized(format!("bad HMAC key: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        let signature = BASE64_URL_SAFE.encode(mac.finalize().into_bytes());

        Ok(L2Headers {
            address: self.address.clone(),
            signature,
            timestamp: timestamp.to_string(),
            api_key: self.credentials.api_key.clone(),
            passphrase: self.credentials.passphrase.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test vector key (never funded).
    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

    fn signer() -> EoaSigner {
        EoaSigner::from_private_key(&SecretString::from(TEST_KEY.to_string())).unwrap()
    }

    // ==================== Address Derivation Tests ====================

    #[test]
    fn test_address_shape() {
        let signer = signer();
        assert!(signer.address().starts_with("0x"));
        assert_eq!(signer.address().len(), 42);
    }

    #[test]
    fn test_address_deterministic() {
        let a = signer();
        let b = signer();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_bad_private_key_rejected() {
        let result = EoaSigner::from_private_key(&SecretString::from("zz".to_string()));
        assert!(matches!(result, Err(PlatformError::Unauthorized(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let output = format!("{:?}", signer());
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("0123456789012345"));
    }

    // ==================== Attestation Tests ====================

    #[test]
    fn test_sign_clob_auth_shape() {
        let headers = sign_clob_auth(&signer(), 0).unwrap();
        assert_eq!(headers.nonce, "0");
        assert!(headers.signature.starts_with("0x"));
        // 65 bytes -> 130 hex chars + prefix.
        assert_eq!(headers.signature.len(), 132);
        assert_eq!(headers.address, signer().address());
    }

    #[test]
    fn test_struct_hash_changes_with_nonce() {
        let s = signer();
        let a = clob_auth_struct_hash(s.address(), "1700000000", 0).unwrap();
        let b = clob_auth_struct_hash(s.address(), "1700000000", 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_domain_separator_stable() {
        assert_eq!(domain_separator(), domain_separator());
    }

    // ==================== Credential Tests ====================

    #[test]
    fn test_empty_credentials_rejected() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            secret: String::new(),
            passphrase: "pass".into(),
        };
        let err = creds.validate().unwrap_err();
        assert!(matches!(err, PlatformError::CredentialDerivation(_)));
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn test_complete_credentials_accepted() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            secret: "c2VjcmV0".into(),
            passphrase: "pass".into(),
        };
        assert!(creds.validate().is_ok());
    }

    // ==================== L2 HMAC Tests ====================

    #[test]
    fn test_l2_headers_deterministic_for_fixed_timestamp() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            secret: BASE64_URL_SAFE.encode(b"super-secret"),
            passphrase: "pass".into(),
        };
        let auth = L2Auth::new(creds, "0xabc".into()).unwrap();
        let a = auth
            .headers_with_timestamp("GET", "/data/order/1", "", "1700000000")
            .unwrap();
        let b = auth
            .headers_with_timestamp("GET", "/data/order/1", "", "1700000000")
            .unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.api_key, "key");
        assert_eq!(a.passphrase, "pass");
    }

    #[test]
    fn test_l2_signature_covers_body() {
        let creds = ApiCredentials {
            api_key: "key".into(),
            secret: BASE64_URL_SAFE.encode(b"super-secret"),
            passphrase: "pass".into(),
        };
        let auth = L2Auth::new(creds, "0xabc".into()).unwrap();
        let a = auth
            .headers_with_timestamp("POST", "/order", r#"{"size":1}"#, "1700000000")
            .unwrap();
        let b = auth
            .headers_with_timestamp("POST", "/order", r#"{"size":2}"#, "1700000000")
            .unwrap();
        assert_ne!(a.signature, b.signature);
    }
}
