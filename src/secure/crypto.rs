//! AES-128-CCM style primitives for KNX Data Secure and KNXnet/IP Secure.
//!
//! KNX uses CCM with a 4-byte MAC on the application layer and a 16-byte
//! MAC on the session wrapper. Both share the same construction: a CBC-MAC
//! (zero IV, zero padding, last block kept) over `B0 || len(A) || A || P`,
//! then a CTR keystream that encrypts the MAC in its first counter block
//! and the payload in the following ones.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// A 128-bit KNX key.
pub type Key = [u8; 16];

/// Build the `B0` block of a data-secure PDU.
///
/// `at` is the address-type octet: bit 7 set for group destinations, low
/// nibble the extended frame format.
pub(crate) fn block0(
    seq: &[u8; 6],
    src: u16,
    dst: u16,
    at: u8,
    tpci: u8,
    apci: u8,
    payload_len: u8,
) -> [u8; 16] {
    let mut b0 = [0u8; 16];
    b0[0..6].copy_from_slice(seq);
    b0[6..8].copy_from_slice(&src.to_be_bytes());
    b0[8..10].copy_from_slice(&dst.to_be_bytes());
    // b0[10] = 0x00
    b0[11] = at;
    b0[12] = tpci;
    b0[13] = apci;
    // b0[14] = 0x00
    b0[15] = payload_len;
    b0
}

/// Build the initial counter block of a data-secure PDU.
pub(crate) fn ctr0(seq: &[u8; 6], src: u16, dst: u16) -> [u8; 16] {
    let mut c = [0u8; 16];
    c[0..6].copy_from_slice(seq);
    c[6..8].copy_from_slice(&src.to_be_bytes());
    c[8..10].copy_from_slice(&dst.to_be_bytes());
    c[15] = 0x01;
    c
}

/// CBC-MAC with zero IV over the concatenation of `parts`, zero-padded to
/// the block size. Returns the full last block.
pub(crate) fn cbc_mac(key: &Key, parts: &[&[u8]]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut state = [0u8; 16];
    let mut fill = 0usize;

    for part in parts {
        for &byte in *part {
            state[fill] ^= byte;
            fill += 1;
            if fill == 16 {
                let mut ga = GenericArray::from(state);
                cipher.encrypt_block(&mut ga);
                state.copy_from_slice(&ga);
                fill = 0;
            }
        }
    }
    if fill != 0 {
        // zero padding: remaining state bytes are already the XOR result
        let mut ga = GenericArray::from(state);
        cipher.encrypt_block(&mut ga);
        state.copy_from_slice(&ga);
    }
    state
}

/// CCM MAC: CBC-MAC over `B0 || be16(len(A)) || A || P`.
pub(crate) fn ccm_mac(key: &Key, b0: &[u8; 16], associated: &[u8], payload: &[u8]) -> [u8; 16] {
    let len = (associated.len() as u16).to_be_bytes();
    cbc_mac(key, &[b0, &len, associated, payload])
}

/// Apply the CTR keystream starting at `ctr` over `buf` in place.
pub(crate) fn ctr_stream(key: &Key, ctr: &[u8; 16], buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(ctr),
    );
    cipher.apply_keystream(buf);
}

/// Encrypt a single block with AES-128 (keystream block for the
/// authentication-only mode).
pub(crate) fn aes_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::from(*block);
    cipher.encrypt_block(&mut ga);
    ga.into()
}

/// Encrypt `mac || payload` in one CTR pass starting at `ctr`; the payload
/// keystream continues right after the MAC bytes. Returns
/// `(encrypted_payload, encrypted_mac)`.
pub(crate) fn ctr_encrypt_mac_and_payload(
    key: &Key,
    ctr: &[u8; 16],
    mac: &[u8],
    payload: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let mut buf = Vec::with_capacity(mac.len() + payload.len());
    buf.extend_from_slice(mac);
    buf.extend_from_slice(payload);
    ctr_stream(key, ctr, &mut buf);
    let enc_payload = buf[mac.len()..].to_vec();
    buf.truncate(mac.len());
    (enc_payload, buf)
}

/// Inverse of [`ctr_encrypt_mac_and_payload`]; returns `(payload, mac)`.
pub(crate) fn ctr_decrypt_mac_and_payload(
    key: &Key,
    ctr: &[u8; 16],
    enc_mac: &[u8],
    enc_payload: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let mut buf = Vec::with_capacity(enc_mac.len() + enc_payload.len());
    buf.extend_from_slice(enc_mac);
    buf.extend_from_slice(enc_payload);
    ctr_stream(key, ctr, &mut buf);
    let payload = buf[enc_mac.len()..].to_vec();
    buf.truncate(enc_mac.len());
    (payload, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
        0x0E, 0x0F,
    ];

    #[test]
    fn block0_layout() {
        let seq = [0, 0, 0, 0, 0, 1];
        let b0 = block0(&seq, 0x1101, 0x0801, 0x80, 0x03, 0xF1, 2);
        assert_eq!(&b0[0..6], &seq);
        assert_eq!(&b0[6..8], &[0x11, 0x01]);
        assert_eq!(&b0[8..10], &[0x08, 0x01]);
        assert_eq!(b0[10], 0x00);
        assert_eq!(b0[11], 0x80);
        assert_eq!(b0[12], 0x03);
        assert_eq!(b0[13], 0xF1);
        assert_eq!(b0[14], 0x00);
        assert_eq!(b0[15], 2);
    }

    #[test]
    fn ctr0_layout() {
        let seq = [9, 8, 7, 6, 5, 4];
        let c = ctr0(&seq, 0x1101, 0x0801);
        assert_eq!(&c[0..6], &seq);
        assert_eq!(&c[10..16], &[0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn aes_block_matches_reference_vector() {
        // NIST SP 800-38A, AES-128 ECB, block 1
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap()
            .try_into()
            .unwrap();
        let plain: [u8; 16] = hex::decode("6bc1bee22e409f96e93d7e117393172a")
            .unwrap()
            .try_into()
            .unwrap();
        let expected = hex::decode("3ad77bb40d7a3660a89ecaf32466ef97").unwrap();
        assert_eq!(aes_block(&key, &plain).to_vec(), expected);
    }

    #[test]
    fn cbc_mac_is_deterministic_and_keyed() {
        let a = cbc_mac(&KEY, &[b"hello world"]);
        let b = cbc_mac(&KEY, &[b"hello", b" world"]);
        assert_eq!(a, b, "part boundaries must not matter");

        let mut other_key = KEY;
        other_key[0] ^= 1;
        assert_ne!(a, cbc_mac(&other_key, &[b"hello world"]));
        assert_ne!(a, cbc_mac(&KEY, &[b"hello worlD"]));
    }

    #[test]
    fn cbc_mac_multiblock() {
        // exactly two blocks, no padding
        let data = [0x5Au8; 32];
        let full = cbc_mac(&KEY, &[&data]);
        // manual chain
        let first = aes_block(&KEY, &{
            let mut b = [0u8; 16];
            b.copy_from_slice(&data[..16]);
            b
        });
        let mut second = [0u8; 16];
        for i in 0..16 {
            second[i] = first[i] ^ data[16 + i];
        }
        assert_eq!(full, aes_block(&KEY, &second));
    }

    #[test]
    fn ctr_roundtrip() {
        let ctr = ctr0(&[1, 2, 3, 4, 5, 6], 0x1101, 0x0102);
        let mac = [0xAAu8; 4];
        let payload = b"\x00\x81and a bit more payload data here".to_vec();

        let (enc_payload, enc_mac) = ctr_encrypt_mac_and_payload(&KEY, &ctr, &mac, &payload);
        assert_eq!(enc_payload.len(), payload.len());
        assert_eq!(enc_mac.len(), 4);
        assert_ne!(enc_payload, payload);

        let (plain, mac_back) = ctr_decrypt_mac_and_payload(&KEY, &ctr, &enc_mac, &enc_payload);
        assert_eq!(plain, payload);
        assert_eq!(mac_back, mac.to_vec());
    }

    #[test]
    fn ccm_mac_covers_associated_data() {
        let b0 = block0(&[0; 6], 1, 2, 0, 0, 0, 0);
        let a = ccm_mac(&KEY, &b0, &[0x10], b"payload");
        let b = ccm_mac(&KEY, &b0, &[0x11], b"payload");
        assert_ne!(a, b);
    }
}
