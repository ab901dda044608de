use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Length of the VNC Authentication challenge and response.
pub const CHALLENGE_LEN: usize = 16;

/// Answers a VNC Authentication challenge.
///
/// The key is the password truncated or zero-padded to 8 bytes with the bit
/// order of every byte reversed; the challenge is encrypted as two DES ECB
/// blocks.
pub fn vnc_auth_response(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}
