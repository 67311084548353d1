use std::{fmt, str::FromStr};

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::{error::Permanent, Error, Result};

pub type BlockHeight = u64;

/// Funds, in the smallest unit.
pub type Currency = u64;

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &hex::encode(self.0)[..8])
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes: [u8; 32] = hex::decode(s)?
                    .try_into()
                    .map_err(|_| Error::msg(concat!(stringify!($name), " must be 32 bytes")))?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// An ed25519 public key. Hosts are identified by theirs.
    PublicKey
);
hex_id!(ContractId);
hex_id!(FileId);
hex_id!(
    /// SHA-256 of a piece's bytes, as stored by a host.
    PieceRoot
);
hex_id!(
    /// Running commitment over every piece root appended to a contract.
    Commitment
);
hex_id!(BlockId);
hex_id!(Address);

pub type HostKey = PublicKey;

impl PublicKey {
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)?;
        key.verify_strict(msg, &ed25519_dalek::Signature::from_bytes(&sig.0))
            .map_err(|e| Permanent::new(&format!("invalid signature from {}: {}", self, e)).into())
    }
}

impl From<&SigningKey> for PublicKey {
    fn from(key: &SigningKey) -> Self {
        PublicKey(key.verifying_key().to_bytes())
    }
}

impl PieceRoot {
    pub fn of(piece: &[u8]) -> PieceRoot {
        PieceRoot(Sha256::digest(piece).into())
    }
}

impl Commitment {
    /// Commitment after appending `root`.
    pub fn extend(&self, root: &PieceRoot) -> Commitment {
        let mut h = Sha256::new();
        h.update(self.0);
        h.update(root.0);
        Commitment(h.finalize().into())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn sign(key: &SigningKey, msg: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(key.sign(msg).to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &hex::encode(self.0)[..8])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes: [u8; 64] = hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature(bytes))
    }
}

/// The state both parties agree on for one contract. Every transfer proposes
/// the next revision; it only takes effect once both have signed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub contract_id: ContractId,
    pub renter_key: PublicKey,
    pub host_key: HostKey,
    pub number: u64,
    pub end_height: BlockHeight,
    pub renter_funds: Currency,
    pub host_funds: Currency,
    pub piece_count: u64,
    pub data_size: u64,
    pub commitment: Commitment,
}

impl Revision {
    /// Digest both signatures cover.
    pub fn sig_hash(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"coffer/revision");
        h.update(self.contract_id.0);
        h.update(self.renter_key.0);
        h.update(self.host_key.0);
        h.update(self.number.to_le_bytes());
        h.update(self.end_height.to_le_bytes());
        h.update(self.renter_funds.to_le_bytes());
        h.update(self.host_funds.to_le_bytes());
        h.update(self.piece_count.to_le_bytes());
        h.update(self.data_size.to_le_bytes());
        h.update(self.commitment.0);
        h.finalize().into()
    }

    /// The unsigned successor of this revision.
    pub fn next(&self) -> Revision {
        Revision {
            number: self.number + 1,
            ..self.clone()
        }
    }

    /// Move `amount` from the renter to the host.
    pub fn pay(&mut self, amount: Currency) -> Result<()> {
        if amount > self.renter_funds {
            return Err(Permanent::new(&format!(
                "insufficient contract funds: need {}, have {}",
                amount, self.renter_funds
            ))
            .into());
        }
        self.renter_funds -= amount;
        self.host_funds += amount;
        Ok(())
    }

    /// Append a stored piece to the contract.
    pub fn append(&mut self, root: &PieceRoot, len: usize) {
        self.piece_count += 1;
        self.data_size += len as u64;
        self.commitment = self.commitment.extend(root);
    }
}
