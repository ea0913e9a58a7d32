//! Session stream cipher.
//!
//! The key exchange delivers a variable-length shared secret; from then on
//! every byte sent on the keyed channel passes through this keystream. The
//! transform consumes cipher state, so applying it twice does not undo it —
//! the peer runs the same keystream to decrypt.

use crate::error::{RelayError, Result};

/// RC4 keystream state over a variable-length key (1..=256 bytes).
pub struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() || key.len() > 256 {
            return Err(RelayError::ProtocolViolation(format!(
                "cipher key must be 1..=256 bytes, got {}",
                key.len()
            )));
        }

        let mut state = [0u8; 256];
        for (i, x) in state.iter_mut().enumerate() {
            *x = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Ok(Self { i: 0, j: 0, state })
    }

    /// Build a cipher from the hex shared secret carried by the key-exchange
    /// packet. An odd-length hex string gets a leading zero nibble.
    pub fn from_shared_secret_hex(hex_key: &str) -> Result<Self> {
        let padded;
        let hex_key = if hex_key.len() % 2 != 0 {
            padded = format!("0{}", hex_key);
            &padded
        } else {
            hex_key
        };
        let key = hex::decode(hex_key).map_err(|e| {
            RelayError::ProtocolViolation(format!("shared secret is not hex: {}", e))
        })?;
        Rc4::new(&key)
    }

    fn next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        self.state
            [(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize]
    }

    /// XOR the buffer with the next keystream bytes, in place.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for x in buf.iter_mut() {
            *x ^= self.next();
        }
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose keystream state
        write!(f, "Rc4")
    }
}
