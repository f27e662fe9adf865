use std::collections::HashSet;

const CONSTRUCT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "i", "in", "into", "is", "it",
    "me", "my", "of", "on", "or", "so", "that", "the", "to", "we", "with",
];

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Lower-cased word tokens with stopwords and single-character tokens removed.
/// Order is preserved and duplicates are dropped.
pub fn tokenize_construct(value: &str) -> Vec<String> {
    let mut seen = HashSet::<String>::new();
    value
        .to_lowercase()
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| {
            !token.is_empty()
                && (token.chars().count() >= 2 || token.chars().all(|c| c.is_ascii_digit()))
        })
        .filter(|token| CONSTRUCT_STOPWORDS.iter().all(|stopword| stopword != token))
        .filter(|token| seen.insert((*token).to_string()))
        .map(str::to_string)
        .collect()
}

/// Lower-cases and strips punctuation so that option labels can be compared to construct text.
pub fn fold_for_comparison(value: &str) -> String {
    let stripped = value
        .to_lowercase()
        .chars()
        .filter(|character| !matches!(character, '\'' | '"' | '.' | ',' | '!' | '?' | ';' | ':'))
        .collect::<String>();
    normalize_whitespace(&stripped)
}

/// Indel similarity on a 0-100 scale: `200 * lcs / (len_a + len_b)`.
/// Returns 0 when either side is empty.
pub fn ratio(left: &str, right: &str) -> f64 {
    let left = left.chars().collect::<Vec<char>>();
    let right = right.chars().collect::<Vec<char>>();
    ratio_chars(&left, &right)
}

/// Best `ratio` of the shorter string against every equally long window of the longer one.
pub fn partial_ratio(left: &str, right: &str) -> f64 {
    let left = left.chars().collect::<Vec<char>>();
    let right = right.chars().collect::<Vec<char>>();
    let (short, long) = if left.len() <= right.len() {
        (left, right)
    } else {
        (right, left)
    };

    if short.is_empty() {
        return 0.0;
    }
    if short.len() == long.len() {
        return ratio_chars(&short, &long);
    }

    let mut best = 0.0_f64;
    for start in 0..=(long.len() - short.len()) {
        let window = &long[start..start + short.len()];
        let score = ratio_chars(&short, window);
        if score > best {
            best = score;
            if best >= 100.0 {
                break;
            }
        }
    }
    best
}

/// `ratio` after sorting the whitespace-separated tokens of both sides.
pub fn token_sort_ratio(left: &str, right: &str) -> f64 {
    ratio(&sorted_tokens(left), &sorted_tokens(right))
}

fn sorted_tokens(value: &str) -> String {
    let mut tokens = value
        .to_lowercase()
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect::<Vec<String>>();
    tokens.sort();
    tokens.join(" ")
}

fn ratio_chars(left: &[char], right: &[char]) -> f64 {
    let total = left.len() + right.len();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let lcs = lcs_length(left, right);
    200.0 * lcs as f64 / total as f64
}

fn lcs_length(left: &[char], right: &[char]) -> usize {
    let (short, long) = if left.len() <= right.len() {
        (left, right)
    } else {
        (right, left)
    };

    let mut previous = vec![0usize; short.len() + 1];
    let mut current = vec![0usize; short.len() + 1];

    for long_char in long {
        for (index, short_char) in short.iter().enumerate() {
            current[index + 1] = if long_char == short_char {
                previous[index] + 1
            } else {
                current[index].max(previous[index + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[short.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_construct_drops_pronouns_and_short_tokens() {
        assert_eq!(tokenize_construct("I save regularly"), vec!["save", "regularly"]);
        assert_eq!(
            tokenize_construct("I'm happy to use the Internet for banking"),
            vec!["happy", "use", "internet", "banking"]
        );
    }

    #[test]
    fn fold_for_comparison_ignores_case_and_punctuation() {
        assert_eq!(fold_for_comparison("I hate to borrow."), "i hate to borrow");
        assert_eq!(fold_for_comparison("  It's  \"fine\", ok"), "its fine ok");
    }

    #[test]
    fn ratio_matches_indel_similarity() {
        assert_eq!(ratio("abc", "abc"), 100.0);
        assert_eq!(ratio("", "abc"), 0.0);
        let value = ratio("kitten", "sitting");
        assert!((value - 61.538).abs() < 0.01, "{value}");
    }

    #[test]
    fn partial_ratio_finds_embedded_phrase() {
        assert_eq!(partial_ratio("save regularly", "members who save regularly each month"), 100.0);
        assert!(partial_ratio("mortgage", "zzzz") < 60.0);
    }

    #[test]
    fn token_sort_ratio_is_order_insensitive() {
        assert_eq!(token_sort_ratio("regularly save", "Save, regularly"), 100.0);
    }
}
