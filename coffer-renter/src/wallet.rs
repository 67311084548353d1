use std::{
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use ed25519_dalek::SigningKey;
use sha2::{Digest as _, Sha256};
use tracing::info;

use crate::{
    error::Transient,
    types::{Address, PublicKey, Revision, Signature},
    Error, Result,
};

/// Signs revisions on the renter's behalf and hands out refund addresses.
pub trait Wallet: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, revision: &Revision) -> Result<Signature>;

    fn new_address(&self) -> Result<Address>;
}

/// A wallet holding a single ed25519 key, derived from a 32-byte seed.
pub struct KeyWallet {
    key: SigningKey,
    seed: [u8; 32],
    locked: AtomicBool,
    next_address: AtomicU64,
}

impl KeyWallet {
    pub fn from_seed(seed: [u8; 32]) -> KeyWallet {
        KeyWallet {
            key: SigningKey::from_bytes(&seed),
            seed,
            locked: AtomicBool::new(false),
            next_address: AtomicU64::new(0),
        }
    }

    pub fn generate() -> KeyWallet {
        KeyWallet::from_seed(rand::random())
    }

    /// Load the seed stored at `path`, creating one if it does not exist.
    pub async fn open(path: &Path) -> Result<KeyWallet> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let seed: [u8; 32] = hex::decode(contents.trim())?
                    .try_into()
                    .map_err(|_| Error::msg("wallet seed must be 32 bytes"))?;
                Ok(KeyWallet::from_seed(seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let wallet = KeyWallet::generate();
                tokio::fs::write(path, hex::encode(wallet.seed)).await?;
                info!(path = ?path, key = %wallet.public_key(), "created wallet");
                Ok(wallet)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(Transient::new("wallet is locked").into());
        }
        Ok(())
    }
}

impl Wallet for KeyWallet {
    fn public_key(&self) -> PublicKey {
        (&self.key).into()
    }

    fn sign(&self, revision: &Revision) -> Result<Signature> {
        self.check_unlocked()?;
        Ok(Signature::sign(&self.key, &revision.sig_hash()))
    }

    fn new_address(&self) -> Result<Address> {
        self.check_unlocked()?;
        let n = self.next_address.fetch_add(1, Ordering::SeqCst);
        let mut h = Sha256::new();
        h.update(self.key.verifying_key().as_bytes());
        h.update(n.to_le_bytes());
        Ok(Address(h.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commitment, ContractId};

    #[tokio::test]
    async fn seed_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wallet.seed");
        let first = KeyWallet::open(&path).await.expect("create");
        let second = KeyWallet::open(&path).await.expect("reopen");
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn locked_wallet_refuses() {
        let wallet = KeyWallet::generate();
        let rev = Revision {
            contract_id: ContractId::random(),
            renter_key: wallet.public_key(),
            host_key: PublicKey::random(),
            number: 3,
            end_height: 10,
            renter_funds: 5,
            host_funds: 0,
            piece_count: 0,
            data_size: 0,
            commitment: Commitment::default(),
        };
        let sig = wallet.sign(&rev).expect("sign");
        wallet.public_key().verify(&rev.sig_hash(), &sig).expect("verify");

        let a = wallet.new_address().expect("address");
        let b = wallet.new_address().expect("address");
        assert_ne!(a, b);

        wallet.lock();
        assert!(wallet.sign(&rev).is_err());
        assert!(wallet.new_address().is_err());
        wallet.unlock();
        assert!(wallet.sign(&rev).is_ok());
    }
}
