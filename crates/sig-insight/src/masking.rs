/// Redacts obvious PII before a transcript snapshot leaves the process
/// boundary toward the chat backend (spec.md §4.4 "payload snapshot").
///
/// This is a conservative, pattern-based pass, not a guarantee: it catches
/// emails and long digit runs (phone numbers, card-like sequences) without
/// attempting named-entity recognition.
pub fn mask_pii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for token in text.split_inclusive(' ') {
        let (word, trailing_space) = match token.strip_suffix(' ') {
            Some(w) => (w, true),
            None => (token, false),
        };

        if looks_like_email(word) {
            out.push_str("[redacted-email]");
        } else if looks_like_long_digit_run(word) {
            out.push_str("[redacted-number]");
        } else {
            out.push_str(word);
        }

        if trailing_space {
            out.push(' ');
        }
    }
    out
}

fn looks_like_email(word: &str) -> bool {
    let Some(at) = word.find('@') else {
        return false;
    };
    word[..at].len() > 0 && word[at + 1..].contains('.')
}

fn looks_like_long_digit_run(word: &str) -> bool {
    let digits = word.chars().filter(|c| c.is_ascii_digit()).count();
    let non_digits = word
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() && !c.is_ascii_digit())
        .count();
    digits >= 7 && non_digits == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_email_addresses() {
        assert_eq!(mask_pii("contact jane@example.com now"), "contact [redacted-email] now");
    }

    #[test]
    fn redacts_long_digit_runs() {
        assert_eq!(mask_pii("call me at 5551234567"), "call me at [redacted-number]");
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        assert_eq!(mask_pii("the customer asked for a refund"), "the customer asked for a refund");
    }

    #[test]
    fn leaves_short_numbers_untouched() {
        assert_eq!(mask_pii("order number 42"), "order number 42");
    }
}
