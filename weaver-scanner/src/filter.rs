//! Link filtering: domain extraction, root-domain grouping, the denylist and
//! per-page outbound link selection. Everything here is pure.

use std::collections::HashSet;
use url::Url;

/// Hosts containing any of these are never followed (social, ads, analytics).
const EXCLUDED_HOSTS: &[&str] = &[
    "facebook.com",
    "fb.com",
    "twitter.com",
    "instagram.com",
    "linkedin.com",
    "youtube.com",
    "google-analytics.com",
    "doubleclick.net",
    "googletagmanager.com",
    "googleapis.com",
];

/// Leading labels of ad and analytics subdomains
const EXCLUDED_LABELS: &[&str] = &["ad", "ads", "analytic", "analytics"];

/// Returns the lowercased host of `url`, or `None` when the URL cannot be
/// fetched as-is (relative links, missing host).
///
/// Scheme-relative URLs (`//host/path`) are treated as https.
pub fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();

    let absolute = if url.starts_with("//") {
        format!("https:{}", url)
    } else if url.contains("://") {
        url.to_string()
    } else {
        return None;
    };

    let parsed = Url::parse(&absolute).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Last two labels of `domain`: `blog.example.com` -> `example.com`.
///
/// Multi-label public suffixes such as `co.uk` are not recognised.
pub fn extract_root_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() >= 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        domain.to_string()
    }
}

pub fn is_excluded(domain: &str) -> bool {
    let domain = domain.to_lowercase();

    if EXCLUDED_HOSTS.iter().any(|host| domain.contains(host)) {
        return true;
    }

    match domain.split_once('.') {
        Some((first, _)) => EXCLUDED_LABELS.contains(&first),
        None => false,
    }
}

/// Picks at most `max_links` distinct cross-domain targets out of the raw
/// links of a page, in the order they first appear.
pub fn filter_links<S: AsRef<str>>(source_url: &str, links: &[S], max_links: usize) -> Vec<String> {
    let Some(source_domain) = extract_domain(source_url) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut filtered = Vec::new();

    for link in links {
        if filtered.len() >= max_links {
            break;
        }

        let link = link.as_ref();
        if link.trim().is_empty() {
            continue;
        }

        let Some(target) = extract_domain(link) else {
            continue;
        };

        if target == source_domain || is_excluded(&target) {
            continue;
        }

        if seen.insert(target.clone()) {
            filtered.push(target);
        }
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain_lowercases() {
        assert_eq!(
            extract_domain("https://Example.COM/x"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_extract_domain_relative() {
        assert_eq!(extract_domain("/relative/path"), None);
        assert_eq!(extract_domain("page.html"), None);
        assert_eq!(extract_domain("#top"), None);
    }

    #[test]
    fn test_extract_domain_scheme_relative() {
        assert_eq!(
            extract_domain("//cdn.example.org/lib.js"),
            Some("cdn.example.org".to_string())
        );
    }

    #[test]
    fn test_extract_domain_strips_port_and_credentials() {
        assert_eq!(
            extract_domain("http://user:pw@Sub.Example.com:8080/a?b=c"),
            Some("sub.example.com".to_string())
        );
    }

    #[test]
    fn test_extract_domain_no_host() {
        assert_eq!(extract_domain("mailto:someone@example.com"), None);
        assert_eq!(extract_domain("file:///etc/hosts"), None);
    }

    #[test]
    fn test_extract_root_domain() {
        assert_eq!(extract_root_domain("a.b.example.com"), "example.com");
        assert_eq!(extract_root_domain("example.com"), "example.com");
        assert_eq!(extract_root_domain("localhost"), "localhost");
    }

    #[test]
    fn test_extract_root_domain_public_suffix_is_naive() {
        assert_eq!(extract_root_domain("bbc.co.uk"), "co.uk");
    }

    #[test]
    fn test_is_excluded() {
        assert!(is_excluded("www.facebook.com"));
        assert!(is_excluded("fonts.googleapis.com"));
        assert!(is_excluded("ads.example.com"));
        assert!(is_excluded("analytics.example.com"));
        assert!(is_excluded("Static.DoubleClick.net"));
        assert!(!is_excluded("example.com"));
        assert!(!is_excluded("adsense-news.org"));
        assert!(!is_excluded("blog.example.com"));
    }

    #[test]
    fn test_filter_links_selection() {
        let links = vec![
            "https://b.com/1",
            "/local",
            "https://a.com/self",
            "https://B.com/2",
            "https://ads.tracker.net/pixel",
            "https://c.com",
            "   ",
            "//d.com/x",
        ];
        let filtered = filter_links("https://a.com/", &links, 10);
        assert_eq!(filtered, vec!["b.com", "c.com", "d.com"]);
    }

    #[test]
    fn test_filter_links_respects_max() {
        let links: Vec<String> = (0..20).map(|i| format!("https://site{}.com", i)).collect();
        let filtered = filter_links("https://a.com", &links, 5);
        assert_eq!(filtered.len(), 5);
        assert_eq!(filtered[0], "site0.com");
        assert_eq!(filtered[4], "site4.com");
    }

    #[test]
    fn test_filter_links_invalid_source() {
        let filtered = filter_links("not a url", &["https://b.com"], 10);
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_filter_links_properties() {
        let links = vec![
            "https://x.org",
            "https://y.org",
            "https://x.org/again",
            "https://src.net/home",
            "https://z.org",
            "https://y.org/more",
        ];
        let filtered = filter_links("https://src.net", &links, 3);

        assert!(!filtered.contains(&"src.net".to_string()));
        assert!(filtered.len() <= 3);
        let unique: HashSet<_> = filtered.iter().collect();
        assert_eq!(unique.len(), filtered.len());
        assert_eq!(filtered, vec!["x.org", "y.org", "z.org"]);
    }
}
