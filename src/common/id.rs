//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Kademlia node Id or a lookup target
///
/// Ids have no meaningful order on their own, only relative to a target,
/// see [Id::cmp_distance].
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Bitwise XOR of two ids, the Kademlia distance metric.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Number of leading bits shared by both ids.
    ///
    /// Returns [ID_BITS] (160) if the ids are equal, otherwise the position
    /// of the highest set bit of `self XOR other`, counted from the most
    /// significant bit.
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let x = self.0[i] ^ other.0[i];

            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Compare the XOR distance of `a` and `b` to this id.
    ///
    /// `Ordering::Less` means `a` is closer.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        self.xor(a).0.cmp(&self.xor(b).0)
    }

    /// Random id sharing the first `prefix_len` bits with this id.
    pub fn random_with_prefix(&self, prefix_len: usize) -> Id {
        let mut random = Id::random();
        let prefix_len = prefix_len.min(ID_BITS);

        let full_bytes = prefix_len / 8;
        random.0[..full_bytes].copy_from_slice(&self.0[..full_bytes]);

        let remaining_bits = prefix_len % 8;
        if remaining_bits > 0 {
            let mask = 0xff_u8 >> remaining_bits;
            random.0[full_bytes] = (self.0[full_bytes] & !mask) | (random.0[full_bytes] & mask);
        }

        random
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
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
    type Err = Error;

    /// Parse a 40 characters hex string.
    fn from_str(s: &str) -> Result<Id> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;

        Id::from_bytes(bytes)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}
