//! Kademlia node Id or a lookup target
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let bytes: [u8; ID_SIZE] = rng.gen();

        Id(bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Hash an arbitrary string key into the identifier space (SHA-1).
    pub fn from_key(key: &str) -> Id {
        Self::hash(key.as_bytes())
    }

    /// Derive a node Id from an ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Id {
        Self::hash(public_key)
    }

    fn hash(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }

    /// Generate a random Id sharing the first `depth` bits of `prefix`.
    pub fn random_with_prefix(prefix: &Id, depth: usize) -> Id {
        let mut id = Id::random();
        let depth = depth.min(ID_BITS);

        let full_bytes = depth / 8;
        id.0[..full_bytes].copy_from_slice(&prefix.0[..full_bytes]);

        let remaining = depth % 8;
        if remaining > 0 {
            let mask = 0xff_u8 << (8 - remaining);
            id.0[full_bytes] = (prefix.0[full_bytes] & mask) | (id.0[full_bytes] & !mask);
        }

        id
    }

    /// XOR distance between this Id and another, as an Id.
    ///
    /// `a.xor(b) == b.xor(a)` and `a.xor(a)` is all zeros.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Number of leading bits this Id shares with `other`. Ranges from 0 to [ID_BITS].
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.0[index / 8];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// Returns a copy of this Id with the bit at `index` set to `value`.
    pub fn with_bit(mut self, index: usize, value: bool) -> Id {
        let mask = 1_u8 << (7 - (index % 8));

        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }

        self
    }

    /// Returns true if the all bits are zeros.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// XOR distance between `a` and `b`.
pub fn distance(a: &Id, b: &Id) -> Id {
    a.xor(b)
}

/// Order `a` and `b` by their XOR distance to `origin`, breaking ties by the lower raw id.
pub fn compare_by_distance(origin: &Id, a: &Id, b: &Id) -> Ordering {
    a.xor(origin)
        .cmp(&b.xor(origin))
        .then_with(|| a.cmp(b))
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<&str> for Id {
    fn from(key: &str) -> Id {
        Id::from_key(key)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() % 2 != 0 {
            return Err(DecodeIdError::OddNumberOfCharacters);
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let byte_str = s
                .get(i * 2..(i * 2) + 2)
                .ok_or(DecodeIdError::InvalidHexCharacter)?;

            let byte =
                u8::from_str_radix(byte_str, 16).map_err(|_| DecodeIdError::InvalidHexCharacter)?;
            bytes.push(byte);
        }

        Ok(Id::from_bytes(bytes)?)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
/// Id bytes of the wrong length.
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug)]
/// Errors decoding an [Id] from a hex string.
pub enum DecodeIdError {
    #[error("Hex encoding should contain an even number of characters")]
    OddNumberOfCharacters,

    #[error("Invalid hex character")]
    InvalidHexCharacter,

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),
}
