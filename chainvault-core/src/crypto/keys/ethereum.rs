//! EVM key derivation (secp256k1, BIP-32)

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use sha2::Sha512;
use zeroize::Zeroize;

use super::derivation::{DerivationPath, KeyPair, PrivateKey, PublicKey, HARDENED_OFFSET};
use crate::chain::ChainFamily;
use crate::error::{Error, Result};

/// Derive an EVM key pair from a seed and derivation path
pub fn derive_ethereum_key_pair(seed: &[u8], path: &DerivationPath) -> Result<KeyPair> {
    let (mut secret_key, mut chain_code) = derive_master_key(seed)?;

    for component in path.components() {
        let (child_key, child_chain_code) = derive_child_key(&secret_key, &chain_code, *component)?;
        secret_key.zeroize();
        secret_key = child_key;
        chain_code = child_chain_code;
    }

    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&secret_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid secret key: {}", e)));
    secret_key.zeroize();
    let secret = secret?;
    let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret);

    let private_key = PrivateKey::new(secret.secret_bytes().to_vec(), ChainFamily::Evm);
    let public_key = PublicKey::new(public_key.serialize_uncompressed().to_vec(), ChainFamily::Evm);

    KeyPair::new(private_key, public_key)
}

fn derive_master_key(seed: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
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
    let secp = Secp256k1::new();
    let parent_secret_key = SecretKey::from_slice(parent_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid parent key: {}", e)))?;

    let mut data = Vec::with_capacity(37);

    if index >= HARDENED_OFFSET {
        data.push(0);
        data.extend_from_slice(parent_key);
    } else {
        let parent_public_key = Secp256k1PublicKey::from_secret_key(&secp, &parent_secret_key);
        data.extend_from_slice(&parent_public_key.serialize());
    }

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

    // child = IL + parent (mod n)
    let child_secret_key = SecretKey::from_slice(&child_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid child key: {}", e)))?;
    child_key.zeroize();

    let child_secret_key = child_secret_key
        .add_tweak(&parent_secret_key.into())
        .map_err(|e| Error::KeyDerivation(format!("Key addition error: {}", e)))?;

    Ok((child_secret_key.secret_bytes(), child_chain_code))
}

/// Get the EVM address (lowercase, 0x-prefixed) from an uncompressed public key
pub fn public_key_to_address(public_key: &PublicKey) -> Result<String> {
    if public_key.family() != ChainFamily::Evm {
        return Err(Error::KeyDerivation("Not an EVM public key".to_string()));
    }

    let public_key = public_key.as_bytes();

    if public_key.len() != 65 {
        return Err(Error::KeyDerivation("Invalid EVM public key length".to_string()));
    }

    // skip the 0x04 prefix, keep the last 20 bytes of the hash
    let key_hash = keccak256(&public_key[1..]);
    Ok(format!("0x{}", hex::encode(&key_hash[12..])))
}

/// Normalize an EVM address for comparisons and index lookups
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| Error::InvalidAddress(format!("missing 0x prefix: {}", address)))?;

    if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidAddress(address.to_string()));
    }

    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("0x9858EfFD232B4033E47d90003D41EC34EcaEda94").unwrap(),
            "0x9858effd232b4033e47d90003d41ec34ecaeda94"
        );
        assert!(normalize_address("9858EfFD232B4033E47d90003D41EC34EcaEda94").is_err());
        assert!(normalize_address("0x1234").is_err());
        assert!(normalize_address("0xzz58EfFD232B4033E47d90003D41EC34EcaEda94").is_err());
    }
}
