//! URL canonicalization for identity comparison.
//!
//! Two URLs that differ only in cosmetic decoration (fragments, theme
//! toggles, analytics tags) must map to the same frontier key.

use reqwest::Url;

/// Query keys with no semantic identity, matched case-insensitively.
fn is_cosmetic_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "theme" || key.starts_with("utm_")
}

/// Produces the canonical string key for a parsed URL.
///
/// Scheme and host are lowercased, the fragment is dropped, cosmetic query
/// keys are removed while preserving the relative order of the survivors,
/// and the path is kept byte-for-byte (trailing slash included). The port
/// appears only when non-default. Normalization is idempotent.
pub fn normalize(url: &Url) -> String {
    let mut out = String::new();

    out.push_str(&url.scheme().to_ascii_lowercase());
    out.push_str("://");

    if let Some(host) = url.host_str() {
        out.push_str(&host.to_ascii_lowercase());
    }

    // `Url::port` is `None` for the scheme's default port.
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    out.push_str(url.path());

    if let Some(query) = url.query() {
        // Raw `&`-separated pairs keep the original percent-encoding intact.
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| {
                let key = pair.split('=').next().unwrap_or(pair);
                !is_cosmetic_key(key)
            })
            .collect();

        if !kept.is_empty() {
            out.push('?');
            out.push_str(&kept.join("&"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> String {
        normalize(&Url::parse(raw).unwrap())
    }

    #[test]
    fn strips_cosmetic_query_keys() {
        assert_eq!(
            key("http://example.com/?theme=dark&utm_source=foo&page=2"),
            "http://example.com/?page=2"
        );
    }

    #[test]
    fn strips_fragment() {
        assert_eq!(key("http://example.com/about#section"), "http://example.com/about");
    }

    #[test]
    fn omits_question_mark_when_query_empties() {
        assert_eq!(key("http://example.com/?utm_campaign=x&theme=light"), "http://example.com/");
    }

    #[test]
    fn preserves_other_keys_in_order() {
        assert_eq!(
            key("http://example.com/search?q=rust&UTM_Medium=mail&lang=en"),
            "http://example.com/search?q=rust&lang=en"
        );
    }

    #[test]
    fn preserves_trailing_slash() {
        assert_eq!(key("http://example.com/docs/"), "http://example.com/docs/");
        assert_eq!(key("http://example.com/docs"), "http://example.com/docs");
    }

    #[test]
    fn keeps_non_default_port_only() {
        assert_eq!(key("http://example.com:8080/x"), "http://example.com:8080/x");
        assert_eq!(key("http://example.com:80/x"), "http://example.com/x");
        assert_eq!(key("https://example.com:443/"), "https://example.com/");
    }

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(key("HTTP://Example.COM/Path"), "http://example.com/Path");
    }

    #[test]
    fn handles_valueless_query_keys() {
        assert_eq!(key("http://example.com/?theme&flag"), "http://example.com/?flag");
    }

    #[test]
    fn idempotent() {
        for raw in [
            "http://Example.com/a/?utm_term=z&x=1#frag",
            "https://h:8443/p?theme=dark",
            "http://example.com/",
        ] {
            let once = key(raw);
            assert_eq!(normalize(&Url::parse(&once).unwrap()), once);
        }
    }
}
