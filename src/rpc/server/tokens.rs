//! Write tokens handed to requesters, and checked on announce.

use crc::{Crc, CRC_32_ISCSI};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Secrets rotate this often, so a token is valid for up to twice as long.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Tokens generator.
///
/// A token is a checksum of the requester's ip and a rotating secret, proving that an
/// announcing node recently asked us for the key from the same address.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new() -> Self {
        Tokens {
            prev_secret: rand::random(),
            curr_secret: rand::random(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated for this address within the past two rotations.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        let prev = generate_token(address.ip(), &self.prev_secret);
        let curr = generate_token(address.ip(), &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = rand::random();

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote node.
    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        generate_token(address.ip(), &self.curr_secret)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new();

        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token));
        assert!(!tokens.validate(SocketAddr::from(([127, 0, 0, 2], 6881)), &token));
        assert!(!tokens.validate(address, &[0, 0, 0, 0]));
    }

    #[test]
    fn tokens_survive_one_rotation() {
        let mut tokens = Tokens::new();
        let address = SocketAddr::from(([10, 0, 0, 1], 4222));
        let token = tokens.generate_token(address);

        tokens.rotate();
        assert!(tokens.validate(address, &token));

        tokens.rotate();
        assert!(!tokens.validate(address, &token));
    }
}
