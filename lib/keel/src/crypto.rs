use ctor::ctor;
use libsodium_sys;
use std::mem::MaybeUninit;
use std::os::raw::c_ulonglong;
use std::ptr;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const EXCHANGE_SIZE: usize = libsodium_sys::crypto_scalarmult_BYTES as usize;
pub const EXCHANGE_SCALAR_SIZE: usize = libsodium_sys::crypto_scalarmult_SCALARBYTES as usize;

pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;
pub const SIGN_PUBLIC_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;

pub const HASH_SIZE: usize = libsodium_sys::crypto_hash_sha256_BYTES as usize;
pub const HMAC_SIZE: usize = libsodium_sys::crypto_auth_hmacsha256_BYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be
/// the plain text size plus the MAC size (16 bytes). The function will fail if the cipher slice
/// is not exactly sized.
///
/// The nonce and key must match those used during decryption, the decryption will fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
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
            ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as c_ulonglong,
            ptr::null(),
            0,
            ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal to
/// the cipher text length minus the MAC (16 bytes). The function will fail if the sizes do not
/// match or the authentication tag does not verify.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
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
            ptr::null_mut(),
            ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as c_ulonglong,
            ptr::null(),
            0,
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

/// Generates an ephemeral X25519 keypair as (public, secret).
#[inline]
pub fn exchange_keypair() -> ([u8; EXCHANGE_SIZE], [u8; EXCHANGE_SCALAR_SIZE]) {
    let mut secret = [0u8; EXCHANGE_SCALAR_SIZE];
    let mut public = [0u8; EXCHANGE_SIZE];

    random_bytes(&mut secret);

    unsafe {
        if libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr()) != 0 {
            panic!("Key exchange base point multiplication failed")
        }
    }

    (public, secret)
}

/// Computes the X25519 shared secret between our secret scalar and the peer public point.
/// Fails on degenerate peer keys producing an all-zero shared secret.
#[inline]
pub fn exchange(
    shared: &mut [u8; EXCHANGE_SIZE],
    secret: &[u8; EXCHANGE_SCALAR_SIZE],
    peer_public: &[u8; EXCHANGE_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), secret.as_ptr(), peer_public.as_ptr()) == 0
    }
}

/// Generates a long term Ed25519 signing keypair as (public, secret).
#[inline]
pub fn sign_keypair() -> ([u8; SIGN_PUBLIC_SIZE], [u8; SIGN_SECRET_SIZE]) {
    let mut public = [0u8; SIGN_PUBLIC_SIZE];
    let mut secret = [0u8; SIGN_SECRET_SIZE];

    unsafe {
        if libsodium_sys::crypto_sign_keypair(public.as_mut_ptr(), secret.as_mut_ptr()) != 0 {
            panic!("Signing keypair generation failed")
        }
    }

    (public, secret)
}

/// Produces a detached Ed25519 signature of the message.
#[inline]
pub fn sign(message: &[u8], secret: &[u8; SIGN_SECRET_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0u8; SIGNATURE_SIZE];

    unsafe {
        if libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ptr::null_mut(),
            message.as_ptr(),
            message.len() as c_ulonglong,
            secret.as_ptr(),
        ) != 0
        {
            panic!("Signing failed")
        }
    }

    signature
}

/// Verifies a detached Ed25519 signature against the message and public key.
#[inline]
pub fn verify(
    signature: &[u8; SIGNATURE_SIZE],
    message: &[u8],
    public: &[u8; SIGN_PUBLIC_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as c_ulonglong,
            public.as_ptr(),
        ) == 0
    }
}

/// Streaming SHA-256 over arbitrary chunks.
pub struct Sha256 {
    state: libsodium_sys::crypto_hash_sha256_state,
}

impl Sha256 {
    #[inline]
    pub fn new() -> Sha256 {
        unsafe {
            let mut state = MaybeUninit::<libsodium_sys::crypto_hash_sha256_state>::uninit();

            if libsodium_sys::crypto_hash_sha256_init(state.as_mut_ptr()) != 0 {
                panic!("SHA-256 state initialization failed")
            }

            Sha256 {
                state: state.assume_init(),
            }
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        unsafe {
            if libsodium_sys::crypto_hash_sha256_update(
                &mut self.state,
                data.as_ptr(),
                data.len() as c_ulonglong,
            ) != 0
            {
                panic!("SHA-256 update failed")
            }
        }
    }

    #[inline]
    pub fn finalize(mut self) -> [u8; HASH_SIZE] {
        let mut digest = [0u8; HASH_SIZE];

        unsafe {
            if libsodium_sys::crypto_hash_sha256_final(&mut self.state, digest.as_mut_ptr()) != 0 {
                panic!("SHA-256 finalization failed")
            }
        }

        digest
    }
}

/// Single-shot HMAC-SHA256 with an arbitrary length key.
#[inline]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = [0u8; HMAC_SIZE];

    unsafe {
        let mut state = MaybeUninit::<libsodium_sys::crypto_auth_hmacsha256_state>::uninit();

        if libsodium_sys::crypto_auth_hmacsha256_init(state.as_mut_ptr(), key.as_ptr(), key.len()) != 0 {
            panic!("HMAC-SHA256 state initialization failed")
        }

        let mut state = state.assume_init();

        if libsodium_sys::crypto_auth_hmacsha256_update(
            &mut state,
            data.as_ptr(),
            data.len() as c_ulonglong,
        ) != 0
        {
            panic!("HMAC-SHA256 update failed")
        }

        if libsodium_sys::crypto_auth_hmacsha256_final(&mut state, mac.as_mut_ptr()) != 0 {
            panic!("HMAC-SHA256 finalization failed")
        }
    }

    mac
}

/// HKDF-SHA256 (RFC 5869) expansion of the input keying material into `out`.
/// The output length must not exceed 255 hash blocks.
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) {
    if out.len() > 255 * HMAC_SIZE {
        panic!("HKDF: requested output length {} too large", out.len())
    }

    let prk = hmac_sha256(salt, ikm);

    let mut block = [0u8; HMAC_SIZE];
    let mut block_len = 0usize;
    let mut counter = 1u8;
    let mut offset = 0usize;

    while offset < out.len() {
        let mut message = Vec::with_capacity(block_len + info.len() + 1);
        message.extend_from_slice(&block[..block_len]);
        message.extend_from_slice(info);
        message.push(counter);

        block = hmac_sha256(&prk, &message);
        block_len = HMAC_SIZE;

        let take = (out.len() - offset).min(HMAC_SIZE);
        out[offset..offset + take].copy_from_slice(&block[..take]);

        offset += take;
        counter += 1;
    }
}
