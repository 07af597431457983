//! Direct message encryption between two keys.
//!
//! The shared secret is the x coordinate of the ECDH point, used unhashed as an AES-256-CBC
//! key.  Payloads are `"{base64 ciphertext}?iv={base64 iv}"`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD};
use snafu::OptionExt;
use strudel_base::{PublicKey, SecretKey};

use super::{DecryptSnafu, InvalidPayloadSnafu, SignerError};

type Encryptor = cbc::Encryptor<aes::Aes256>;
type Decryptor = cbc::Decryptor<aes::Aes256>;

fn shared_key(secret: &SecretKey, peer: &PublicKey) -> [u8; 32] {
    let peer = secp256k1::PublicKey::from_x_only_public_key(*peer.as_x_only(), secp256k1::Parity::Even);
    let point = secp256k1::ecdh::shared_secret_point(&peer, &secret.as_secp());
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    key
}

/// Encrypts `plaintext` from `secret` to `peer`.
pub fn encrypt(
    secret: &SecretKey,
    peer: &PublicKey,
    plaintext: &str,
    rng: &mut (impl rand::RngCore + rand::CryptoRng),
) -> String {
    let key = shared_key(secret, peer);
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);
    let ciphertext =
        Encryptor::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    format!("{}?iv={}", STANDARD.encode(ciphertext), STANDARD.encode(iv))
}

/// Decrypts a payload sent by `peer` to `secret`.
pub fn decrypt(secret: &SecretKey, peer: &PublicKey, payload: &str) -> Result<String, SignerError> {
    let (ciphertext, iv) = payload.split_once("?iv=").context(InvalidPayloadSnafu {
        reason: "missing iv",
    })?;
    let ciphertext = STANDARD.decode(ciphertext).ok().context(InvalidPayloadSnafu {
        reason: "ciphertext is not base64",
    })?;
    let iv: [u8; 16] = STANDARD
        .decode(iv)
        .ok()
        .and_then(|iv| iv.try_into().ok())
        .context(InvalidPayloadSnafu {
            reason: "iv must be 16 bytes of base64",
        })?;
    let key = shared_key(secret, peer);
    let plaintext = Decryptor::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| DecryptSnafu.build())?;
    String::from_utf8(plaintext).map_err(|_| DecryptSnafu.build())
}
