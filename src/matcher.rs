use crate::error::ConfigError;
use num_bigint::BigUint;
use ripemd::Ripemd160;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

pub type TargetId = usize;

const P2PKH_VERSION: u8 = 0x00;
const WIF_VERSION: u8 = 0x80;

/// How the public key is serialized before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    Compressed,
    Uncompressed,
}

/// Which encodings a target may have been created under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingPolicy {
    /// Try both; historical puzzle keys do not all share one convention
    #[default]
    Either,
    Compressed,
    Uncompressed,
}

impl EncodingPolicy {
    fn allows(self, encoding: KeyEncoding) -> bool {
        match self {
            EncodingPolicy::Either => true,
            EncodingPolicy::Compressed => encoding == KeyEncoding::Compressed,
            EncodingPolicy::Uncompressed => encoding == KeyEncoding::Uncompressed,
        }
    }
}

impl FromStr for EncodingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "either" | "both" | "auto" => Ok(EncodingPolicy::Either),
            "compressed" => Ok(EncodingPolicy::Compressed),
            "uncompressed" => Ok(EncodingPolicy::Uncompressed),
            other => Err(format!(
                "unknown key encoding '{}' (expected either, compressed or uncompressed)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFormat {
    /// Base58check pay-to-pubkey-hash, `1...`
    P2pkh,
    /// Bech32 v0 pay-to-witness-pubkey-hash, `bc1q...`
    P2wpkh,
}

/// Serialized public key in both encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBytes {
    pub compressed: [u8; 33],
    pub uncompressed: [u8; 65],
}

impl PublicKeyBytes {
    pub fn encoded(&self, encoding: KeyEncoding) -> &[u8] {
        match encoding {
            KeyEncoding::Compressed => &self.compressed,
            KeyEncoding::Uncompressed => &self.uncompressed,
        }
    }
}

/// Scalar-to-public-key primitive.
///
/// Returns `None` for scalars that are not valid private keys (zero, or not
/// below the curve order). Such scalars still count as checked.
pub trait KeyDeriver: Send + Sync {
    fn derive_public_key(&self, secret: &[u8; 32]) -> Option<PublicKeyBytes>;
}

/// secp256k1 point multiplication via libsecp256k1.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Deriver;

impl KeyDeriver for Secp256k1Deriver {
    fn derive_public_key(&self, secret: &[u8; 32]) -> Option<PublicKeyBytes> {
        let secret_key = SecretKey::from_slice(secret).ok()?;
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);
        Some(PublicKeyBytes {
            compressed: public_key.serialize(),
            uncompressed: public_key.serialize_uncompressed(),
        })
    }
}

/// Big-endian 32-byte form of a scalar, or `None` if it needs more than 256 bits.
pub fn scalar_to_bytes(scalar: &BigUint) -> Option<[u8; 32]> {
    let bytes = scalar.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(out)
}

/// Hash160 = RIPEMD160(SHA256(data))
#[inline]
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

pub fn p2pkh_address(hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(P2PKH_VERSION);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

pub fn p2wpkh_address(hash: &[u8; 20]) -> String {
    bech32::segwit::encode(bech32::hrp::BC, bech32::segwit::VERSION_0, hash)
        .expect("a 20-byte v0 witness program is always encodable")
}

pub fn encode_address(format: AddressFormat, hash: &[u8; 20]) -> String {
    match format {
        AddressFormat::P2pkh => p2pkh_address(hash),
        AddressFormat::P2wpkh => p2wpkh_address(hash),
    }
}

/// Wallet import format for a found key.
pub fn private_key_wif(scalar: &BigUint, encoding: KeyEncoding) -> Option<String> {
    let secret = scalar_to_bytes(scalar)?;
    let mut payload = Vec::with_capacity(34);
    payload.push(WIF_VERSION);
    payload.extend_from_slice(&secret);
    if encoding == KeyEncoding::Compressed {
        payload.push(0x01);
    }
    Some(bs58::encode(payload).with_check().into_string())
}

/// A known address the search is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub address: String,
    pub format: AddressFormat,
    pub hash160: [u8; 20],
    pub encoding: EncodingPolicy,
}

impl Target {
    pub fn parse(id: TargetId, address: &str, policy: EncodingPolicy) -> Result<Self, ConfigError> {
        let address = address.trim();
        let invalid = |reason: String| ConfigError::InvalidTarget {
            address: address.to_string(),
            reason,
        };

        if address.to_lowercase().starts_with("bc1") {
            let (hrp, version, program) =
                bech32::segwit::decode(address).map_err(|e| invalid(e.to_string()))?;
            if hrp != bech32::hrp::BC {
                return Err(invalid(format!("unsupported network prefix '{}'", hrp)));
            }
            if version != bech32::segwit::VERSION_0 || program.len() != 20 {
                return Err(invalid("only v0 pay-to-witness-pubkey-hash is supported".to_string()));
            }
            if policy == EncodingPolicy::Uncompressed {
                return Err(invalid("witness addresses commit to compressed keys".to_string()));
            }

            let mut hash = [0u8; 20];
            hash.copy_from_slice(&program);
            return Ok(Target {
                id,
                address: address.to_lowercase(),
                format: AddressFormat::P2wpkh,
                hash160: hash,
                encoding: EncodingPolicy::Compressed,
            });
        }

        let payload = bs58::decode(address)
            .with_check(None)
            .into_vec()
            .map_err(|e| invalid(e.to_string()))?;
        if payload.len() != 21 {
            return Err(invalid(format!("unexpected payload length {}", payload.len())));
        }
        if payload[0] != P2PKH_VERSION {
            return Err(invalid(format!(
                "version byte {:#04x} is not pay-to-pubkey-hash",
                payload[0]
            )));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..21]);
        Ok(Target {
            id,
            address: address.to_string(),
            format: AddressFormat::P2pkh,
            hash160: hash,
            encoding: policy,
        })
    }

    fn accepts(&self, encoding: KeyEncoding) -> bool {
        self.encoding.allows(encoding)
    }
}

/// What a target set can match, independent of order, duplicates and address
/// spelling: one `format:hash160:encoding` entry per distinct target.
pub fn target_fingerprint(targets: &[Target]) -> Vec<String> {
    let mut entries: Vec<String> = targets
        .iter()
        .map(|t| format!("{:?}:{}:{:?}", t.format, hex::encode(t.hash160), t.encoding).to_lowercase())
        .collect();
    entries.sort_unstable();
    entries.dedup();
    entries
}

/// First four bytes of the SHA-256 of a fingerprint, hex.
pub fn fingerprint_digest(fingerprint: &[String]) -> String {
    let digest = Sha256::digest(fingerprint.join(",").as_bytes());
    hex::encode(&digest[..4])
}

/// A scalar whose derived address hit a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHit {
    pub target_id: TargetId,
    pub encoding: KeyEncoding,
    pub derived_address: String,
}

/// Derives addresses for scalars and looks them up in the target set.
///
/// Only the encodings some target can match are hashed: a P2PKH target left
/// at [`EncodingPolicy::Either`] costs one extra HASH160 per candidate, a
/// witness target never needs the uncompressed key.
pub struct AddressMatcher {
    targets: Vec<Target>,
    by_address: HashMap<String, TargetId>,
    compressed: HashMap<[u8; 20], TargetId>,
    uncompressed: HashMap<[u8; 20], TargetId>,
    deriver: Arc<dyn KeyDeriver>,
}

impl AddressMatcher {
    pub fn new(targets: Vec<Target>, deriver: Arc<dyn KeyDeriver>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }

        let mut by_address = HashMap::new();
        let mut compressed = HashMap::new();
        let mut uncompressed = HashMap::new();
        for target in &targets {
            by_address.entry(target.address.clone()).or_insert(target.id);
            if target.accepts(KeyEncoding::Compressed) {
                compressed.entry(target.hash160).or_insert(target.id);
            }
            if target.accepts(KeyEncoding::Uncompressed) {
                uncompressed.entry(target.hash160).or_insert(target.id);
            }
        }

        Ok(AddressMatcher {
            targets,
            by_address,
            compressed,
            uncompressed,
            deriver,
        })
    }

    /// Parse every address and build a matcher over them.
    pub fn from_addresses<S: AsRef<str>>(
        addresses: &[S],
        policy: EncodingPolicy,
        deriver: Arc<dyn KeyDeriver>,
    ) -> Result<Self, ConfigError> {
        let targets = addresses
            .iter()
            .enumerate()
            .map(|(id, address)| Target::parse(id, address.as_ref(), policy))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(targets, deriver)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    /// Address of `scalar` under one encoding and format.
    pub fn derive(&self, scalar: &BigUint, encoding: KeyEncoding, format: AddressFormat) -> Option<String> {
        if format == AddressFormat::P2wpkh && encoding == KeyEncoding::Uncompressed {
            return None;
        }
        let secret = scalar_to_bytes(scalar)?;
        let public_key = self.deriver.derive_public_key(&secret)?;
        Some(encode_address(format, &hash160(public_key.encoded(encoding))))
    }

    /// Look an address up in the target set.
    pub fn matches(&self, address: &str) -> Option<&Target> {
        let trimmed = address.trim();
        let key = if trimmed.to_lowercase().starts_with("bc1") {
            trimmed.to_lowercase()
        } else {
            trimmed.to_string()
        };
        self.by_address.get(&key).and_then(|&id| self.targets.get(id))
    }

    /// Derive `scalar` under every encoding the target set needs and report
    /// the first target it hits.
    pub fn check_scalar(&self, scalar: &BigUint) -> Option<TargetHit> {
        let secret = scalar_to_bytes(scalar)?;
        let public_key = self.deriver.derive_public_key(&secret)?;

        for (encoding, table) in [
            (KeyEncoding::Compressed, &self.compressed),
            (KeyEncoding::Uncompressed, &self.uncompressed),
        ] {
            if table.is_empty() {
                continue;
            }
            let hash = hash160(public_key.encoded(encoding));
            if let Some(&target_id) = table.get(&hash) {
                let format = self.targets[target_id].format;
                return Some(TargetHit {
                    target_id,
                    encoding,
                    derived_address: encode_address(format, &hash),
                });
            }
        }

        None
    }
}
