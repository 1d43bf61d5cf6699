//! Symmetric key derivation from a key URI
//!
//! The URI is a tiny interpreter: an empty scheme passes the body through
//! verbatim as the key, and `pem:` points at an RSA public key used to
//! wrap a freshly generated 64-byte key. The wrapped block can then live
//! inside the image as a crypto message object without the plaintext key
//! ever touching disk.

use crate::errors::CryptError;
use rand::RngCore;
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use std::{fs, path::Path, path::PathBuf};

/// Number of random bytes generated for a wrapped key
pub const GENERATED_KEY_LEN: usize = 64;

/// PEM tag of the wrapped key block stored in the image
pub const MESSAGE_TAG: &str = "ENCRYPTED MESSAGE";

/// A parsed key URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Empty scheme: the URI body is the key itself
    Passthrough(Vec<u8>),
    /// `pem:` scheme: path to an RSA public key in PEM form
    Pem(PathBuf),
}

/// Parse a key URI, rejecting any scheme other than empty or `pem:`
pub fn parse_uri(uri: &str) -> Result<KeySource, CryptError> {
    if let Some(path) = uri.strip_prefix("pem:") {
        return Ok(KeySource::Pem(PathBuf::from(path)));
    }
    if let Some(colon) = uri.find(':') {
        let scheme = &uri[..colon];
        if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CryptError::UnsupportedKeyUri(scheme.to_string()));
        }
    }
    Ok(KeySource::Passthrough(uri.as_bytes().to_vec()))
}

/// Key material ready for the encrypt direction: the plaintext key plus,
/// for a `pem:` source, the wrapped block destined for the image
#[derive(Debug, Clone)]
pub struct PlaintextKey {
    pub bytes: Vec<u8>,
    pub wrapped: Option<String>,
}

/// Derive a new symmetric key for the encrypt direction
pub fn new_key(source: &KeySource) -> Result<PlaintextKey, CryptError> {
    match source {
        KeySource::Passthrough(bytes) => Ok(PlaintextKey {
            bytes: bytes.clone(),
            wrapped: None,
        }),
        KeySource::Pem(path) => {
            let mut bytes = vec![0u8; GENERATED_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut bytes);
            let wrapped = wrap_key(path, &bytes)?;
            Ok(PlaintextKey {
                bytes,
                wrapped: Some(wrapped),
            })
        }
    }
}

/// Wrap a plaintext key with RSA-OAEP/SHA-256 under the referenced public
/// key, producing a PEM-encoded message block
pub fn wrap_key(public_pem: &Path, plaintext: &[u8]) -> Result<String, CryptError> {
    let pem_text = fs::read_to_string(public_pem)?;
    let public = RsaPublicKey::from_public_key_pem(&pem_text)
        .map_err(|err| CryptError::PemKey(err.to_string()))?;
    let ciphertext = public.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)?;
    Ok(pem::encode(&pem::Pem::new(MESSAGE_TAG, ciphertext)))
}

/// Recover a plaintext key from a PEM message block with the matching
/// RSA private key
pub fn unwrap_key(private_pem: &Path, block: &str) -> Result<Vec<u8>, CryptError> {
    let pem_text = fs::read_to_string(private_pem)?;
    let private = RsaPrivateKey::from_pkcs8_pem(&pem_text)
        .map_err(|err| CryptError::PemKey(err.to_string()))?;
    let message = pem::parse(block)?;
    Ok(private.decrypt(Oaep::new::<Sha256>(), message.contents())?)
}
