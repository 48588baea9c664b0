//! Crypto Service: derives the data key from the operator's secret and a
//! persisted salt, seals/opens clip and snapshot bytes with AES-256-GCM, and
//! holds `key_hash` (a stable identifier for which key sealed a given clip).
//!
//! The derived key never leaves this module; callers only ever get
//! [`CryptoService::seal`]/[`CryptoService::open`] and the hex `key_hash`.

use base::{err, Error, ErrorKind, ResultExt};
use ring::aead::{self, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;
use zeroize::Zeroizing;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 600_000;

/// A fresh random nonce used exactly once, matching `ring`'s
/// single-use-key-per-seal API without us having to hand-roll counter logic.
struct OneNonce(Option<Nonce>);

impl NonceSequence for OneNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        self.0.take().ok_or(ring::error::Unspecified)
    }
}

pub struct CryptoService {
    key_bytes: Zeroizing<[u8; 32]>,
    key_hash: String,
    rng: SystemRandom,
}

/// Generates (if absent) and returns the persisted 32-byte salt at `path`,
/// created with mode 0600.
pub fn load_or_create_salt(path: &std::path::Path) -> Result<[u8; SALT_LEN], Error> {
    use std::io::{Read, Write};
    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut buf = [0u8; SALT_LEN];
            f.read_exact(&mut buf)
                .err_kind_msg(ErrorKind::KeyDerivationFailed, format!("reading salt {}", path.display()))?;
            Ok(buf)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).err_kind(ErrorKind::KeyDerivationFailed)?;
            }
            let mut salt = [0u8; SALT_LEN];
            SystemRandom::new()
                .fill(&mut salt)
                .map_err(|_| err!(KeyDerivationFailed, "generating salt"))?;
            let mut f = std::fs::File::create(path).err_kind(ErrorKind::KeyDerivationFailed)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                f.set_permissions(std::fs::Permissions::from_mode(0o600))
                    .err_kind(ErrorKind::KeyDerivationFailed)?;
            }
            f.write_all(&salt).err_kind(ErrorKind::KeyDerivationFailed)?;
            Ok(salt)
        }
        Err(e) => Err(e).err_kind(ErrorKind::KeyDerivationFailed),
    }
}

impl CryptoService {
    /// Derives the data key from `user_secret` and `salt` via PBKDF2-HMAC-SHA256.
    pub fn derive(user_secret: &str, salt: &[u8; SALT_LEN]) -> Result<Self, Error> {
        let mut key_bytes = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            salt,
            user_secret.as_bytes(),
            &mut key_bytes,
        );
        let key_hash = base::strutil::hex(ring::digest::digest(&ring::digest::SHA256, user_secret.as_bytes()).as_ref());
        Ok(CryptoService {
            key_bytes: Zeroizing::new(key_bytes),
            key_hash,
            rng: SystemRandom::new(),
        })
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    fn unbound_key(&self) -> Result<UnboundKey, Error> {
        UnboundKey::new(&AES_256_GCM, &self.key_bytes[..])
            .map_err(|_| err!(KeyDerivationFailed, "constructing AES-256-GCM key"))
    }

    /// Seals `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| err!(ClipFinalizeFailed, "generating seal nonce"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut sealing = aead::SealingKey::new(self.unbound_key()?, OneNonce(Some(nonce)));

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
            .map_err(|_| err!(ClipFinalizeFailed, "sealing clip bytes"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Inverse of [`CryptoService::seal`]: `sealed` must be `nonce ||
    /// ciphertext || tag`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < NONCE_LEN {
            return Err(err!(Internal, "sealed blob shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| err!(Internal, "malformed nonce"))?;
        let mut opening = aead::OpeningKey::new(self.unbound_key()?, OneNonce(Some(nonce)));

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening
            .open_in_place(aead::Aad::empty(), &mut in_out)
            .map_err(|_| err!(Internal, "opening sealed blob: authentication failed"))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trips() {
        let salt = [7u8; SALT_LEN];
        let svc = CryptoService::derive("hunter2", &salt).unwrap();
        let plaintext = b"clip bytes go here";
        let sealed = svc.seal(plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], &plaintext[..]);
        let opened = svc.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampering_is_detected() {
        let salt = [7u8; SALT_LEN];
        let svc = CryptoService::derive("hunter2", &salt).unwrap();
        let mut sealed = svc.seal(b"clip bytes").unwrap();
        *sealed.last_mut().unwrap() ^= 1;
        svc.open(&sealed).unwrap_err();
    }

    #[test]
    fn different_secrets_yield_different_key_hash() {
        let salt = [7u8; SALT_LEN];
        let a = CryptoService::derive("alpha", &salt).unwrap();
        let b = CryptoService::derive("beta", &salt).unwrap();
        assert_ne!(a.key_hash(), b.key_hash());
    }

    #[test]
    fn salt_is_persisted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salt");
        let s1 = load_or_create_salt(&path).unwrap();
        let s2 = load_or_create_salt(&path).unwrap();
        assert_eq!(s1, s2);
    }
}
