//! Big integer helpers shared by key agreement and dice rolls
//!
//! All values are non-negative. Byte encodings are fixed width and
//! most-significant byte first.

use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Width in bytes of every hashed or keyed integer
pub const WIDTH: usize = 32;

/// Values that can be normalised into a group integer
pub trait GroupInt {
    /// Convert into a `BigUint`, parsing hex strings on the way
    fn to_group_int(&self) -> Result<BigUint>;
}

impl GroupInt for BigUint {
    fn to_group_int(&self) -> Result<BigUint> {
        Ok(self.clone())
    }
}

impl GroupInt for u64 {
    fn to_group_int(&self) -> Result<BigUint> {
        Ok(BigUint::from(*self))
    }
}

impl GroupInt for u32 {
    fn to_group_int(&self) -> Result<BigUint> {
        Ok(BigUint::from(*self))
    }
}

impl GroupInt for str {
    fn to_group_int(&self) -> Result<BigUint> {
        parse_hex(self)
    }
}

impl GroupInt for String {
    fn to_group_int(&self) -> Result<BigUint> {
        parse_hex(self)
    }
}

impl<T: GroupInt + ?Sized> GroupInt for &T {
    fn to_group_int(&self) -> Result<BigUint> {
        (**self).to_group_int()
    }
}

/// Parse a hexadecimal string, with or without a `0x` prefix
pub fn parse_hex(s: &str) -> Result<BigUint> {
    let digits = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or_else(|| s.trim());

    if digits.is_empty() {
        return Err(Error::Encoding("empty hex string".into()));
    }

    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| Error::Encoding(format!("invalid hex integer {:?}", s)))
}

/// Lowercase hex without leading zeros, the form used on the wire
pub fn to_hex(value: &BigUint) -> String {
    format!("{:x}", value)
}

/// Compute `base^exponent mod modulus`
///
/// Not constant time. Runtime depends on the exponent length, as it does for
/// any square-and-multiply.
pub fn modpow<B, E, M>(base: B, exponent: E, modulus: M) -> Result<BigUint>
where
    B: GroupInt,
    E: GroupInt,
    M: GroupInt,
{
    let modulus = modulus.to_group_int()?;
    if modulus.is_zero() {
        return Err(Error::Encoding("modulus must be non-zero".into()));
    }
    if modulus.is_one() {
        return Ok(BigUint::zero());
    }

    let base = base.to_group_int()?;
    let exponent = exponent.to_group_int()?;
    Ok(base.modpow(&exponent, &modulus))
}

/// Interpret big-endian bytes as an integer
pub fn bytes_to_int(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// Encode `value` as exactly `length` big-endian bytes
///
/// Values that need more than `length` bytes are an error, never truncated.
pub fn int_to_bytes(value: &BigUint, length: usize) -> Result<Vec<u8>> {
    if value.is_zero() {
        return Ok(vec![0u8; length]);
    }

    let raw = value.to_bytes_be();
    if raw.len() > length {
        return Err(Error::Encoding(format!(
            "integer needs {} bytes, only {} available",
            raw.len(),
            length
        )));
    }

    let mut out = vec![0u8; length - raw.len()];
    out.extend_from_slice(&raw);
    Ok(out)
}

/// SHA-256 of the 32-byte encoding of `value`, read back as an integer
pub fn hash_to_int(value: &BigUint) -> Result<BigUint> {
    let bytes = int_to_bytes(value, WIDTH)?;
    Ok(bytes_to_int(&Sha256::digest(bytes)))
}

/// Uniformly random integer of `bytes` bytes from the OS RNG
pub fn random_int(bytes: usize) -> BigUint {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    bytes_to_int(&buf)
}

/// Largest prime tried when splitting off the smooth part of a group order
pub const SMOOTH_BOUND: u32 = 1 << 16;

/// Product of every prime factor of `n` no larger than `bound`, with
/// multiplicity
///
/// For a prime modulus `p`, raising to `smooth_part(p - 1)` maps the group
/// onto its large-order subgroup; an element sent to one there has small
/// order only.
pub fn smooth_part(n: &BigUint, bound: u32) -> BigUint {
    let mut rest = n.clone();
    let mut smooth = BigUint::one();
    if rest.is_zero() {
        return smooth;
    }
    for d in 2..=bound {
        while (&rest % d).is_zero() {
            rest /= d;
            smooth *= d;
        }
        if rest.is_one() {
            break;
        }
    }
    smooth
}

/// `2^255 - 19`, the default group modulus
pub fn default_modulus() -> BigUint {
    (BigUint::one() << 255u32) - BigUint::from(19u32)
}
