//! URL extraction from free text

use regex::Regex;
use std::sync::LazyLock;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhttps?://[^\s<>"'`]+"#).expect("URL pattern is a valid regex")
});

/// Characters that end a sentence rather than a URL
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"'];

/// Every http(s) URL in `text`, in order of appearance
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|url| !url.ends_with("://"))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_order() {
        let urls = extract_urls(
            "Compare https://a.example/one.png and http://b.example/two.jpg?size=large please",
        );
        assert_eq!(
            urls,
            vec![
                "https://a.example/one.png",
                "http://b.example/two.jpg?size=large"
            ]
        );
    }

    #[test]
    fn test_strips_trailing_punctuation() {
        let urls = extract_urls("What is in this image (https://img.example/cat.png)? See https://x.example/a.");
        assert_eq!(urls, vec!["https://img.example/cat.png", "https://x.example/a"]);
    }

    #[test]
    fn test_no_urls() {
        assert!(extract_urls("describe the picture I sent earlier").is_empty());
        assert!(extract_urls("ftp://files.example/x.png").is_empty());
        assert!(extract_urls("https://").is_empty());
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        assert_eq!(
            extract_urls("HTTPS://Example.com/Photo.JPG"),
            vec!["HTTPS://Example.com/Photo.JPG"]
        );
    }
}
