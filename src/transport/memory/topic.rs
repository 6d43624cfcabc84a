// src/transport/memory/topic.rs

//! Topic-exchange routing key matching.
//!
//! Keys and binding patterns are dot-separated words. In a pattern, `*`
//! matches exactly one word and `#` matches zero or more words. An empty key
//! has zero words, so only patterns made of `#` alone match it.

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    // ---
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

/// True if routing key `key` matches binding `pattern`.
pub(super) fn topic_matches(pattern: &str, key: &str) -> bool {
    matches_words(&words(pattern), &words(key))
}
