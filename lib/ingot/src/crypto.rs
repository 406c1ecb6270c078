use ctor::ctor;
use hkdf::Hkdf;
use libsodium_sys;
use sha2::{Digest, Sha256};

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;
pub const POINT_SIZE: usize = libsodium_sys::crypto_scalarmult_curve25519_BYTES as usize;
pub const SCALAR_SIZE: usize = libsodium_sys::crypto_scalarmult_curve25519_SCALARBYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size
/// will be the plain text size plus the MAC size. The function will fail if the cipher
/// slice does not have exactly that size.
///
/// The additional data, nonce and key must match those used during decryption, the
/// decryption will fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is
/// equal to the cipher text length minus the MAC. The function will fail if the sizes
/// do not match or the authentication tag does not verify.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Generates a fresh X25519 key pair as (secret, public).
#[inline]
pub fn x25519_keypair() -> ([u8; SCALAR_SIZE], [u8; POINT_SIZE]) {
    let mut secret = [0u8; SCALAR_SIZE];
    random_bytes(&mut secret);
    let public = x25519_public(&secret);
    (secret, public)
}

/// Computes the public point for an X25519 secret scalar.
#[inline]
pub fn x25519_public(secret: &[u8; SCALAR_SIZE]) -> [u8; POINT_SIZE] {
    let mut public = [0u8; POINT_SIZE];
    unsafe {
        libsodium_sys::crypto_scalarmult_curve25519_base(public.as_mut_ptr(), secret.as_ptr());
    }
    public
}

/// Computes the X25519 shared secret. Returns `None` for degenerate peer points,
/// which libsodium rejects.
#[inline]
pub fn x25519_shared(
    secret: &[u8; SCALAR_SIZE],
    their_public: &[u8; POINT_SIZE],
) -> Option<[u8; POINT_SIZE]> {
    let mut shared = [0u8; POINT_SIZE];
    let result = unsafe {
        libsodium_sys::crypto_scalarmult_curve25519(
            shared.as_mut_ptr(),
            secret.as_ptr(),
            their_public.as_ptr(),
        )
    };

    if result == 0 {
        Some(shared)
    } else {
        None
    }
}

/// Derives the session material from an ECDH shared secret: a symmetric session key
/// plus a 64-bit session identifier used for logging and diagnostics.
#[inline]
pub fn derive_session(shared: &[u8; POINT_SIZE], salt: &[u8]) -> ([u8; KEY_SIZE], u64) {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);

    let mut okm = [0u8; KEY_SIZE + 8];
    hk.expand(b"cpc session v1", &mut okm)
        .expect("HKDF output length is valid");

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&okm[KEY_SIZE..]);

    (key, u64::from_le_bytes(id_bytes))
}

/// Short identifier of a public key (truncated SHA-256), exchanged during the
/// handshake so both sides can confirm they hold the same binding key.
#[inline]
pub fn key_id(public: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(public);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let nonce = [1u8; NONCE_SIZE];
        let plain = b"over the wire";
        let ad = b"header";

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, plain, ad, &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(decrypt(&mut decoded, &cipher, ad, &nonce, &key));
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn test_aead_rejects_tampered_additional_data() {
        let key = [7u8; KEY_SIZE];
        let nonce = [1u8; NONCE_SIZE];
        let plain = b"over the wire";

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, plain, b"header", &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(!decrypt(&mut decoded, &cipher, b"hEader", &nonce, &key));
    }

    #[test]
    fn test_aead_rejects_wrong_nonce() {
        let key = [7u8; KEY_SIZE];
        let plain = b"over the wire";

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, plain, b"ad", &[1u8; NONCE_SIZE], &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(!decrypt(&mut decoded, &cipher, b"ad", &[2u8; NONCE_SIZE], &key));
    }

    #[test]
    fn test_ecdh_agreement() {
        let (a_secret, a_public) = x25519_keypair();
        let (b_secret, b_public) = x25519_keypair();

        let ab = x25519_shared(&a_secret, &b_public).unwrap();
        let ba = x25519_shared(&b_secret, &a_public).unwrap();

        assert_eq!(ab, ba);

        let (key_a, id_a) = derive_session(&ab, b"salt");
        let (key_b, id_b) = derive_session(&ba, b"salt");

        assert_eq!(key_a, key_b);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn test_derive_session_salt_separation() {
        let shared = [9u8; POINT_SIZE];

        let (key_a, _) = derive_session(&shared, b"salt one");
        let (key_b, _) = derive_session(&shared, b"salt two");

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_key_id_stable() {
        let public = [3u8; POINT_SIZE];
        assert_eq!(key_id(&public), key_id(&public));
        assert_ne!(key_id(&public), key_id(&[4u8; POINT_SIZE]));
    }
}
