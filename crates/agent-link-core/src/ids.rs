//! Message identifiers and connection epochs.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

/// Server-issued identifier of a stream message.
///
/// Opaque to the client, but issued monotonically by the server. Ids are
/// ordered by the text before their trailing decimal run, then by the value
/// of that run (of any length), so `m9 < m10`. The raw string breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix and trailing number. The number is its significant digits
    /// keyed by count first, which orders runs of any length by value.
    fn sort_key(&self) -> (&str, Option<(usize, &str)>) {
        let digits = self
            .0
            .bytes()
            .rev()
            .take_while(u8::is_ascii_digit)
            .count();
        let (prefix, number) = self.0.split_at(self.0.len() - digits);
        if digits == 0 {
            return (prefix, None);
        }
        let significant = number.trim_start_matches('0');
        (prefix, Some((significant.len(), significant)))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Generation token of one physical connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Raw counter value (for logging).
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_suffix_ordering() {
        assert!(MessageId::from("m9") < MessageId::from("m10"));
        assert!(MessageId::from("m42") > MessageId::from("m41"));
        assert_eq!(
            MessageId::from("m42").cmp(&MessageId::from("m42")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_suffix_longer_than_u64() {
        let huge = MessageId::from("m123456789012345678901234567890");
        assert!(MessageId::from("m99") < huge);
        assert!(MessageId::from(format!("{huge}0")) > huge);
        let padded = MessageId::from("m0123456789012345678901234567890");
        assert_ne!(padded.cmp(&huge), Ordering::Equal);
        assert_eq!(padded.cmp(&huge), huge.cmp(&padded).reverse());
    }

    #[test]
    fn test_mixed_shapes_stay_transitive() {
        let a9 = MessageId::from("a9");
        let a10 = MessageId::from("a10");
        let a1z = MessageId::from("a1z");
        assert!(a9 < a10);
        assert!(a10 < a1z);
        assert!(a9 < a1z);
    }

    #[test]
    fn test_mixed_prefix_falls_back_to_lexicographic() {
        assert!(MessageId::from("a10") < MessageId::from("b2"));
        assert!(MessageId::from("abc") < MessageId::from("abd"));
    }

    #[test]
    fn test_leading_zeros_still_total() {
        let a = MessageId::from("m007");
        let b = MessageId::from("m7");
        assert_ne!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn test_epoch_advances() {
        let e = Epoch::default();
        assert!(e.next() > e);
        assert_eq!(e.next().get(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_order_is_total_and_transitive(
            a in "[ab1z]{0,3}[0-9]{0,25}",
            b in "[ab1z]{0,3}[0-9]{0,25}",
            c in "[ab1z]{0,3}[0-9]{0,25}",
        ) {
            let (a, b, c) = (MessageId::new(a), MessageId::new(b), MessageId::new(c));
            proptest::prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            proptest::prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            if a <= b && b <= c {
                proptest::prop_assert!(a <= c);
            }
        }
    }
}
