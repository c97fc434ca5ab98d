//! Column-name normalization and similarity scoring for the map stage.

use std::collections::HashSet;

/// Lowercase a column name and strip separators and everything outside
/// `[a-z0-9]`, so `Customer E-Mail`, `customer_email` and `customerEmail`
/// all collapse to `customeremail`.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Dice coefficient over character bigrams of the normalized names, in
/// `[0, 1]`. Short names (under two characters) only match exactly.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return if a.is_empty() { 0.0 } else { 1.0 };
    }
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let bigrams_a = bigrams(&a);
    let bigrams_b = bigrams(&b);
    let common = bigrams_a.intersection(&bigrams_b).count();
    (2.0 * common as f64) / (bigrams_a.len() + bigrams_b.len()) as f64
}

fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_separators_and_case() {
        assert_eq!(normalize_name("Customer E-Mail"), "customeremail");
        assert_eq!(normalize_name("order_id"), "orderid");
        assert_eq!(normalize_name("  Total $ "), "total");
    }

    #[test]
    fn identical_names_score_one() {
        assert_eq!(name_similarity("amount", "amount"), 1.0);
        assert_eq!(name_similarity("Order ID", "order_id"), 1.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(name_similarity("amount", "customer_email") < 0.3);
    }

    #[test]
    fn near_names_score_between() {
        let sim = name_similarity("customer_email", "customer_e_mail");
        assert!(sim > 0.8, "got {sim}");
        let sim = name_similarity("total_amount", "amount");
        assert!(sim > 0.3 && sim < 1.0, "got {sim}");
    }

    #[test]
    fn short_and_empty_names() {
        assert_eq!(name_similarity("", ""), 0.0);
        assert_eq!(name_similarity("a", "a"), 1.0);
        assert_eq!(name_similarity("a", "b"), 0.0);
    }

    #[test]
    fn similarity_is_symmetric() {
        let pairs = [("amount", "total"), ("id", "order_id"), ("mail", "email")];
        for (a, b) in pairs {
            assert_eq!(name_similarity(a, b), name_similarity(b, a));
        }
    }
}
