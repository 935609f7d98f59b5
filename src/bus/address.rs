use std::fmt::{Debug, Display, Formatter};

/// A bus address is an ordered list of whitespace-separated tokens, e.g.
///  `media:audio module:engine app:rat instance:1234`. A token that is exactly
///  `*` is a wildcard matching any single token on the other side.
///
/// Addresses name an endpoint (self address) as well as the destination
///  pattern of a message; both sides of a match may contain wildcards.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Address {
    tokens: Vec<String>,
}

pub const WILDCARD: &str = "*";

impl Address {
    pub fn parse(s: &str) -> Address {
        Address {
            tokens: s.split_whitespace().map(|t| t.to_string()).collect(),
        }
    }

    /// The empty address. As a destination pattern it matches every endpoint
    ///  (see [Address::matches]), which is what the keep-alive relies on.
    pub fn empty() -> Address {
        Address { tokens: Vec::new() }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Position-by-position comparison of two patterns. A `*` token on either
    ///  side matches any single token on the other side.
    ///
    /// Matching stops as soon as either side runs out of tokens: a shorter
    ///  pattern matches as a prefix of a longer one. This permits
    ///  less-specific self addresses (and the empty pattern addressing
    ///  everyone) and is relied on by peers, so it must not be tightened.
    pub fn matches(&self, other: &Address) -> bool {
        self.tokens.iter()
            .zip(&other.tokens)
            .all(|(a, b)| a == WILDCARD || b == WILDCARD || a == b)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.tokens.join(" "))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::identical("media:audio module:engine", "media:audio module:engine", true)]
    #[case::different_token("media:audio module:engine", "media:audio module:ui", false)]
    #[case::wildcard_left("media:audio * app:rat", "media:audio module:engine app:rat", true)]
    #[case::wildcard_right("media:audio module:engine", "media:audio *", true)]
    #[case::wildcard_both("* module:engine", "media:audio *", true)]
    #[case::wildcard_is_single_token("*", "media:audio module:engine", true)]
    #[case::star_with_suffix_is_literal("*x", "media:audio", false)]
    #[case::prefix_matches_longer("media:audio", "media:audio module:engine app:rat", true)]
    #[case::longer_matches_prefix("media:audio module:engine app:rat", "media:audio", true)]
    #[case::empty_matches_anything("", "media:audio module:engine", true)]
    #[case::empty_matches_empty("", "", true)]
    #[case::order_matters("module:engine media:audio", "media:audio module:engine", false)]
    fn test_matches(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        let a = Address::parse(a);
        let b = Address::parse(b);
        assert_eq!(a.matches(&b), expected);
        assert_eq!(b.matches(&a), expected);
    }

    #[rstest]
    #[case::typical("media:audio module:engine app:rat instance:1234")]
    #[case::single("module:control")]
    #[case::empty("")]
    fn test_matches_is_reflexive(#[case] a: &str) {
        let a = Address::parse(a);
        assert!(a.matches(&a));
    }

    #[test]
    fn test_any_single_token_replaced_by_wildcard_still_matches() {
        let a = Address::parse("media:audio module:engine app:rat instance:1234");
        for i in 0..a.tokens().len() {
            let mut tokens = a.tokens().to_vec();
            tokens[i] = WILDCARD.to_string();
            let b = Address::parse(&tokens.join(" "));
            assert!(a.matches(&b));
            assert!(b.matches(&a));
        }
    }

    #[rstest]
    #[case::normalizes_whitespace("  media:audio \t module:engine ", "media:audio module:engine")]
    #[case::empty("", "")]
    fn test_parse_display_roundtrip(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(Address::parse(input).to_string(), expected);
    }
}
