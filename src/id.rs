//! Sortable, type-prefixed entity IDs.
//!
//! Uses newtypes for identifiers rather than bare `String`s: every entity
//! gets its own ID type via [`def_id!`], so a `BookId` can never be passed
//! where a `SeriesId` is expected.

use data_encoding::BASE32_NOPAD;
use rand::RngCore as _;

use crate::clock::Clock as _;

/// Defines a newtype ID wrapping a `String`, transparent for (de)serialization,
/// `Display`/`FromStr`, and comparable/hashable/orderable by its string value
/// (so lexicographic ID order is stable primary-key iteration order).
#[macro_export]
macro_rules! def_id {
    ($(#[$outer:meta])* $name:ident, $prefix:literal) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const TYPE_PREFIX: &'static str = $prefix;

            pub fn generate(gen: &dyn $crate::id::IdGenerator) -> Self {
                Self(gen.generate($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Generates sortable, type-prefixed identifiers.
///
/// A trait (rather than a bare function) so tests can inject deterministic
/// IDs, mirroring how `Clock` abstracts time at call
/// sites that need determinism under test.
pub trait IdGenerator: Send + Sync {
    /// Returns a new ID of the form `<prefix>-<21 sortable chars>`.
    fn generate(&self, prefix: &str) -> String;
}

/// Default generator: an 8-character zero-padded base32 millisecond
/// timestamp segment (so IDs sort roughly chronologically) followed by 13
/// base32-encoded random characters.
#[derive(Debug, Default)]
pub struct SortableIdGenerator;

impl IdGenerator for SortableIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        let millis = crate::clock::SystemClock.now_millis();
        let ts_part = encode_base32_fixed_width(millis as u64, 8);

        let mut rand_bytes = [0u8; 9];
        rand::rng().fill_bytes(&mut rand_bytes);
        let rand_part = &BASE32_NOPAD.encode(&rand_bytes)[..13];

        format!("{prefix}-{ts_part}{}", rand_part.to_lowercase())
    }
}

fn encode_base32_fixed_width(mut value: u64, width: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";
    let mut chars = vec![b'0'; width];
    for i in (0..width).rev() {
        chars[i] = ALPHABET[(value % 32) as usize];
        value /= 32;
    }
    String::from_utf8(chars).expect("ascii alphabet")
}

/// Test/deterministic generator: a monotonically increasing counter, useful
/// for assertions that depend on ID lexicographic order (e.g. a
/// `s-1 .. s-5` pagination fixture).
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counter: std::sync::atomic::AtomicU64,
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{prefix}-{n:021}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_type_prefix() {
        let gen = SortableIdGenerator;
        let id = gen.generate("book");
        assert!(id.starts_with("book-"));
    }

    #[test]
    fn sequential_generator_is_lexicographically_ordered() {
        let gen = SequentialIdGenerator::default();
        let a = gen.generate("s");
        let b = gen.generate("s");
        let c = gen.generate("s");
        let mut v = vec![c.clone(), a.clone(), b.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }
}
