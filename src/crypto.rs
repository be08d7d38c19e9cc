//! Key derivation, condition/fulfillment generation, and authenticated encryption
//! for STREAM packets, all rooted in a single shared secret established out of band.

use bytes::BytesMut;
#[cfg(test)]
use lazy_static::lazy_static;
use log::error;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, digest, hmac};

const NONCE_LENGTH: usize = 12;
const AUTH_TAG_LENGTH: usize = 16;

/// Maximum plaintext size of an inner STREAM packet before encryption, per the
/// wire format's frame-count/frame encoding.
pub const MAX_DATA_SIZE: usize = 32767;

static ENCRYPTION_KEY_STRING: &[u8] = b"ilp_stream_encryption";
static FULFILLMENT_GENERATION_STRING: &[u8] = b"ilp_stream_fulfillment";
static PADDING_KEY_STRING: &[u8] = b"ilp_stream_padding";

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let output = hmac::sign(&key, message);
    let mut to_return: [u8; 32] = [0; 32];
    to_return.copy_from_slice(output.as_ref());
    to_return
}

pub fn generate_fulfillment(shared_secret: &[u8], data: &[u8]) -> [u8; 32] {
    let key = hmac_sha256(shared_secret, FULFILLMENT_GENERATION_STRING);
    hmac_sha256(&key[..], data)
}

pub fn hash_sha256(preimage: &[u8]) -> [u8; 32] {
    let output = digest::digest(&digest::SHA256, preimage);
    let mut to_return: [u8; 32] = [0; 32];
    to_return.copy_from_slice(output.as_ref());
    to_return
}

pub fn generate_condition(shared_secret: &[u8], data: &[u8]) -> [u8; 32] {
    let fulfillment = generate_fulfillment(shared_secret, data);
    hash_sha256(&fulfillment)
}

/// Condition used for unfulfillable probe packets: nobody, including us, knows
/// the preimage, so the receiver can never construct a matching fulfillment.
pub fn random_condition() -> [u8; 32] {
    let mut condition_slice: [u8; 32] = [0; 32];
    SystemRandom::new()
        .fill(&mut condition_slice)
        .expect("Failed to securely generate random condition!");
    condition_slice
}

/// Derives the token used to mint new per-connection shared secrets server-side
/// (not used for packet encryption; see the padding sub-key for that).
pub fn generate_server_secret(seed: &[u8]) -> [u8; 32] {
    hmac_sha256(seed, PADDING_KEY_STRING)
}

pub fn encrypt(shared_secret: &[u8], plaintext: BytesMut) -> BytesMut {
    let mut nonce: [u8; NONCE_LENGTH] = [0; NONCE_LENGTH];
    SystemRandom::new()
        .fill(&mut nonce[..])
        .expect("Failed to securely generate a random nonce!");

    encrypt_with_nonce(shared_secret, plaintext, nonce)
}

/// Zero-pads `plaintext` up to `MAX_DATA_SIZE` bytes so that packet lengths on
/// the wire do not leak information about how much of a stream's window was
/// used. No-op if the plaintext is already at or beyond that size.
pub fn pad_to_max_data_size(mut plaintext: BytesMut) -> BytesMut {
    if plaintext.len() < MAX_DATA_SIZE {
        plaintext.resize(MAX_DATA_SIZE, 0);
    }
    plaintext
}

fn encrypt_with_nonce(
    shared_secret: &[u8],
    mut plaintext: BytesMut,
    nonce: [u8; NONCE_LENGTH],
) -> BytesMut {
    let key = hmac_sha256(shared_secret, ENCRYPTION_KEY_STRING);
    let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
        .expect("Failed to create a new sealing key for encrypting data!");
    let key = aead::LessSafeKey::new(key);

    let additional_data = aead::Aad::from(&[]);

    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        additional_data,
        &mut plaintext,
    )
    .unwrap_or_else(|err| {
        error!("Error encrypting {:?}", err);
        panic!("failed to seal STREAM packet: {:?}", err);
    });

    // Tag goes immediately after the nonce, ciphertext last.
    let auth_tag_position = plaintext.len() - AUTH_TAG_LENGTH;
    let mut tag_data = plaintext.split_off(auth_tag_position);
    tag_data.unsplit(plaintext);

    let mut nonce_tag_data = BytesMut::from(&nonce[..]);
    nonce_tag_data.unsplit(tag_data);

    nonce_tag_data
}

pub fn decrypt(shared_secret: &[u8], mut ciphertext: BytesMut) -> Result<BytesMut, ()> {
    if ciphertext.len() < NONCE_LENGTH + AUTH_TAG_LENGTH {
        return Err(());
    }

    let key = hmac_sha256(shared_secret, ENCRYPTION_KEY_STRING);
    let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
        .expect("Failed to create a new opening key for decrypting data!");
    let key = aead::LessSafeKey::new(key);

    let mut nonce: [u8; NONCE_LENGTH] = [0; NONCE_LENGTH];
    nonce.copy_from_slice(&ciphertext.split_to(NONCE_LENGTH));

    let auth_tag = ciphertext.split_to(AUTH_TAG_LENGTH);
    let additional_data: &[u8] = &[];

    // ring expects the tag after the data.
    ciphertext.unsplit(auth_tag);

    let length = key
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(additional_data),
            &mut ciphertext,
        )
        .map_err(|err| {
            error!("Error decrypting STREAM packet: {:?}", err);
        })?
        .len();
    ciphertext.truncate(length);
    Ok(ciphertext)
}

#[cfg(test)]
mod fulfillment_and_condition {
    use super::*;
    use bytes::Bytes;

    lazy_static! {
        static ref SHARED_SECRET: Vec<u8> = vec![
            126, 219, 117, 93, 118, 248, 249, 211, 20, 211, 65, 110, 237, 80, 253, 179, 81, 146,
            229, 67, 231, 49, 92, 127, 254, 230, 144, 102, 103, 166, 150, 36
        ];
        static ref DATA: Vec<u8> = vec![
            119, 248, 213, 234, 63, 200, 224, 140, 212, 222, 105, 159, 246, 203, 66, 155, 151,
            172, 68, 24, 76, 232, 90, 10, 237, 146, 189, 73, 248, 196, 177, 108, 115, 223
        ];
        static ref FULFILLMENT: Vec<u8> = vec![
            24, 6, 56, 73, 229, 236, 88, 227, 82, 112, 152, 49, 152, 73, 182, 183, 198, 7, 233,
            124, 119, 65, 13, 68, 54, 108, 120, 193, 59, 226, 107, 39
        ];
    }

    #[test]
    fn derives_expected_fulfillment() {
        let fulfillment =
            generate_fulfillment(&Bytes::from(&SHARED_SECRET[..]), &Bytes::from(&DATA[..]));
        assert_eq!(fulfillment.to_vec(), *FULFILLMENT);
    }

    #[test]
    fn condition_is_hash_of_fulfillment() {
        let fulfillment = generate_fulfillment(&SHARED_SECRET, &DATA);
        let condition = generate_condition(&SHARED_SECRET, &DATA);
        assert_eq!(condition, hash_sha256(&fulfillment));
    }

    #[test]
    fn random_conditions_are_not_all_equal() {
        let a = random_condition();
        let b = random_condition();
        assert_ne!(a, b);
    }
}

#[cfg(test)]
mod encrypt_decrypt_test {
    use super::*;

    static SHARED_SECRET: &[u8] = &[
        126, 219, 117, 93, 118, 248, 249, 211, 20, 211, 65, 110, 237, 80, 253, 179, 81, 146, 229,
        67, 231, 49, 92, 127, 254, 230, 144, 102, 103, 166, 150, 36,
    ];
    static PLAINTEXT: &[u8] = &[99, 0, 12, 255, 77, 31];
    static CIPHERTEXT: &[u8] = &[
        119, 248, 213, 234, 63, 200, 224, 140, 212, 222, 105, 159, 246, 203, 66, 155, 151, 172,
        68, 24, 76, 232, 90, 10, 237, 146, 189, 73, 248, 196, 177, 108, 115, 223,
    ];
    static NONCE: [u8; NONCE_LENGTH] = [119, 248, 213, 234, 63, 200, 224, 140, 212, 222, 105, 159];

    #[test]
    fn encrypts_with_fixed_nonce_deterministically() {
        let encrypted =
            encrypt_with_nonce(&SHARED_SECRET[..], BytesMut::from(&PLAINTEXT[..]), NONCE);
        assert_eq!(&encrypted[..], CIPHERTEXT);
    }

    #[test]
    fn decrypts_known_ciphertext() {
        let decrypted = decrypt(SHARED_SECRET, BytesMut::from(CIPHERTEXT));
        assert_eq!(&decrypted.unwrap()[..], PLAINTEXT);
    }

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let ciphertext = encrypt(SHARED_SECRET, BytesMut::from(PLAINTEXT));
        let decrypted = decrypt(SHARED_SECRET, ciphertext);
        assert_eq!(&decrypted.unwrap()[..], PLAINTEXT);
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let mut ciphertext = encrypt(SHARED_SECRET, BytesMut::from(PLAINTEXT));
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decrypt(SHARED_SECRET, ciphertext).is_err());
    }

    #[test]
    fn padding_fills_to_max_data_size() {
        let padded = pad_to_max_data_size(BytesMut::from(PLAINTEXT));
        assert_eq!(padded.len(), MAX_DATA_SIZE);
        assert_eq!(&padded[..PLAINTEXT.len()], PLAINTEXT);
        assert!(padded[PLAINTEXT.len()..].iter().all(|&b| b == 0));
    }
}
