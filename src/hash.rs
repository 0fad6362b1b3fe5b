use std::fmt;

/// 128-bit content digest used for resource identity and versioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(u128);

impl Digest {
    pub const fn from_raw(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Hashes arbitrary bytes.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let hash = blake3::hash(bytes);
    let mut head = [0u8; 16];
    head.copy_from_slice(&hash.as_bytes()[..16]);
    Digest(u128::from_le_bytes(head))
}

#[inline]
pub fn hash_str(text: &str) -> Digest {
    hash_bytes(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_digest() {
        assert_eq!(hash_str("main.glsl"), hash_str("main.glsl"));
        assert_ne!(hash_str("main.glsl"), hash_str("main.glsl~"));
    }

    #[test]
    fn displays_as_fixed_width_hex() {
        let text = Digest::from_raw(0xab).to_string();
        assert_eq!(text.len(), 32);
        assert!(text.ends_with("ab"));
    }
}
