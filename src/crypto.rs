//
// Random values, keyed hashes and constant time comparisons
//
use data_encoding::{Encoding, BASE64, HEXLOWER, HEXUPPER};
use ring::{digest, hmac};

use crate::error::{Error, MapResult};

/// Alphabet the human-facing device flow user codes are drawn from.
pub const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const USER_CODE_LENGTH: usize = 8;

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

pub fn get_random_byte() -> u8 {
    get_random_bytes::<1>()[0]
}

/// Encode random bytes using the provided function.
pub fn encode_random_bytes<const N: usize>(e: Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}

/// Returns a random lowercase hex string, `N` being the number of underlying bytes.
pub fn get_random_token_hex<const N: usize>() -> String {
    HEXLOWER.encode(&get_random_bytes::<N>())
}

/// Generates a user code by sampling the fixed alphabet without modulo bias:
/// random bytes outside the usable range are rejected and redrawn.
pub fn generate_user_code() -> String {
    let len = USER_CODE_ALPHABET.len();
    let zone = (u8::MAX as usize / len) * len; // largest multiple of len that fits in a byte
    let mut code = String::with_capacity(USER_CODE_LENGTH);
    while code.len() < USER_CODE_LENGTH {
        let byte = get_random_byte() as usize;
        if byte < zone {
            code.push(USER_CODE_ALPHABET[byte % len] as char);
        }
    }
    code
}

//
// Digests
//

pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest::digest(&digest::SHA256, data).as_ref())
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Re-encode hex encoded data (a checksum) to base64, as expected by the
/// `x-amz-checksum-*` family of object storage headers.
pub fn b16_to_b64(hex_string: &str) -> Result<String, Error> {
    let raw = HEXUPPER.decode(hex_string.to_uppercase().as_bytes()).map_res("Invalid hex encoded value")?;
    Ok(BASE64.encode(&raw))
}

//
// HMAC
//

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    HEXLOWER.encode(hmac::sign(&key, data).as_ref())
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

//
// Constant time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use ring::constant_time::verify_slices_are_equal;

    verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}

impl From<data_encoding::DecodeError> for Error {
    fn from(e: data_encoding::DecodeError) -> Self {
        Error::new("Decoding error", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_user_code_shape() {
        for _ in 0..32 {
            let code = generate_user_code();
            assert_eq!(code.len(), USER_CODE_LENGTH);
            assert!(code.bytes().all(|b| USER_CODE_ALPHABET.contains(&b)), "{code}");
        }
    }

    #[test]
    fn check_b16_to_b64() {
        // Matches `base64(unhex(...))` of common tooling
        assert_eq!(b16_to_b64("deadbeef").unwrap(), "3q2+7w==");
        assert!(b16_to_b64("not-hex").is_err());
    }

    #[test]
    fn check_ct_eq() {
        assert!(ct_eq("secret", "secret"));
        assert!(!ct_eq("secret", "Secret"));
        assert!(!ct_eq("secret", "secret0"));
    }

    #[test]
    fn check_hmac_is_keyed() {
        let a = hmac_sha256_hex(b"key-a", b"payload");
        let b = hmac_sha256_hex(b"key-b", b"payload");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
