//! Token ring routing primitives: tokens, the Murmur3 partitioner,
//! replica placement strategies and the tablet index.

pub mod ring;
pub mod tablets;

/// The low-order id of a shard within a node.
pub type Shard = u32;

/// A token on the ring, produced by hashing a partition key.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    /// The raw 64-bit token value.
    pub value: i64,
}

impl Token {
    /// Wraps a raw token value.
    pub fn new(value: i64) -> Self {
        Token { value }
    }
}

impl std::str::FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Token::new)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// The partitioner a cluster hashes partition keys with.
///
/// Partitioner names arrive from the server as fully qualified Java class
/// names; matching is done on the class name suffix. An unrecognized
/// partitioner is not an error, it merely disables token-aware routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum PartitionerName {
    /// The Cassandra-flavoured Murmur3 partitioner.
    #[default]
    Murmur3,
}

impl PartitionerName {
    /// Recognizes a partitioner by the suffix of its class name.
    pub fn from_class_name(name: &str) -> Option<Self> {
        if name.ends_with("Murmur3Partitioner") {
            Some(PartitionerName::Murmur3)
        } else {
            None
        }
    }

    /// Hashes a serialized partition key into a token.
    pub fn hash_one(&self, pk: &[u8]) -> Token {
        match self {
            PartitionerName::Murmur3 => murmur3_token(pk),
        }
    }
}

const C1: i64 = 0x87c3_7b91_1142_53d5_u64 as i64;
const C2: i64 = 0x4cf5_ad43_2745_937f_u64 as i64;

/// Computes the Murmur3 hash of a serialized partition key, the
/// Cassandra way.
///
/// This is the x64-128 variant restricted to its first half, operating on
/// *signed* bytes in the tail for bug-compatibility with the original
/// Java implementation. `i64::MIN` is mapped to `i64::MAX`, as the
/// server reserves the minimum token.
pub fn murmur3_token(pk: &[u8]) -> Token {
    let mut h1: i64 = 0;
    let mut h2: i64 = 0;

    let mut chunks = pk.chunks_exact(16);
    for block in &mut chunks {
        // Full blocks are read little-endian; signedness is irrelevant here.
        let mut k1 = i64::from_le_bytes(block[0..8].try_into().unwrap());
        let mut k2 = i64::from_le_bytes(block[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    // The tail is sign-extended byte by byte.
    let tail = chunks.remainder();
    if tail.len() > 8 {
        let mut k2: i64 = 0;
        for (i, byte) in tail.iter().enumerate().skip(8) {
            k2 ^= (*byte as i8 as i64) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        let mut k1: i64 = 0;
        for (i, byte) in tail.iter().enumerate().take(8) {
            k1 ^= (*byte as i8 as i64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= pk.len() as i64;
    h2 ^= pk.len() as i64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);

    if h1 == i64::MIN {
        h1 = i64::MAX;
    }
    Token::new(h1)
}

fn fmix(mut k: i64) -> i64 {
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k
}
