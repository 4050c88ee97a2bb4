//! Solana key derivation (ed25519, SLIP-10)

use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroize;

use super::derivation::{DerivationPath, KeyPair, PrivateKey, PublicKey, HARDENED_OFFSET};
use crate::chain::ChainFamily;
use crate::error::{Error, Result};

/// Derive a Solana key pair from a seed and derivation path.
///
/// SLIP-10 for ed25519 only defines hardened children, so every component of
/// `path` must be hardened.
pub fn derive_solana_key_pair(seed: &[u8], path: &DerivationPath) -> Result<KeyPair> {
    if !path.is_fully_hardened() {
        return Err(Error::KeyDerivation(
            "ed25519 derivation requires a fully hardened path".to_string(),
        ));
    }

    let (mut secret_key, mut chain_code) = derive_master_key(seed)?;

    for component in path.components() {
        let (child_key, child_chain_code) = derive_child_key(&secret_key, &chain_code, *component)?;
        secret_key.zeroize();
        secret_key = child_key;
        chain_code = child_chain_code;
    }

    let signing_key = SigningKey::from_bytes(&secret_key);
    secret_key.zeroize();
    let verifying_key = VerifyingKey::from(&signing_key);

    let private_key = PrivateKey::new(signing_key.to_bytes().to_vec(), ChainFamily::Solana);
    let public_key = PublicKey::new(verifying_key.to_bytes().to_vec(), ChainFamily::Solana);

    KeyPair::new(private_key, public_key)
}

fn derive_master_key(seed: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut hmac = Hmac::<Sha512>::new_from_slice(b"ed25519 seed")
        .map_err(|_| Error::KeyDerivation("HMAC error".to_string()))?;

    hmac.update(seed);
    let result = hmac.finalize().into_bytes();

    let mut secret_key = [0u8; 32];
    let mut chain_code = [0u8; 32];

    secret_key.copy_from_slice(&result[0..32]);
    chain_code.copy_from_slice(&result[32..64]);

    Ok((secret_key, chain_code))
}

fn derive_child_key(
    parent_key: &[u8; 32],
    parent_chain_code: &[u8; 32],
    index: u32,
) -> Result<([u8; 32], [u8; 32])> {
    debug_assert!(index >= HARDENED_OFFSET);

    let mut data = Vec::with_capacity(37);
    data.push(0);
    data.extend_from_slice(parent_key);
    data.extend_from_slice(&index.to_be_bytes());

    let mut hmac = Hmac::<Sha512>::new_from_slice(parent_chain_code)
        .map_err(|_| Error::KeyDerivation("HMAC error".to_string()))?;

    hmac.update(&data);
    data.zeroize();
    let result = hmac.finalize().into_bytes();

    let mut child_key = [0u8; 32];
    let mut child_chain_code = [0u8; 32];

    child_key.copy_from_slice(&result[0..32]);
    child_chain_code.copy_from_slice(&result[32..64]);

    Ok((child_key, child_chain_code))
}

/// Get the Solana address (base58 public key)
pub fn public_key_to_address(public_key: &PublicKey) -> Result<String> {
    if public_key.family() != ChainFamily::Solana {
        return Err(Error::KeyDerivation("Not a Solana public key".to_string()));
    }

    let public_key = public_key.as_bytes();

    if public_key.len() != 32 {
        return Err(Error::KeyDerivation("Invalid Solana public key length".to_string()));
    }

    Ok(bs58::encode(public_key).into_string())
}

/// Validate a base58 Solana address. Solana addresses are case-sensitive and
/// are returned unchanged.
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let decoded = bs58::decode(trimmed)
        .into_vec()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;

    if decoded.len() != 32 {
        return Err(Error::InvalidAddress(format!(
            "{}: expected 32 bytes, got {}",
            address,
            decoded.len()
        )));
    }

    Ok(trimmed.to_string())
}
