use regex::Regex;
use std::sync::OnceLock;

/// Rewrite applied to result URLs before they reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CdnRewrite {
    #[default]
    None,
    /// `base + url`, for accelerators that take the original URL as a path.
    Prepend(String),
    /// Swap scheme and host of the URL for `base`.
    ReplaceHost(String),
}

fn origin_pattern() -> &'static Regex {
    static ORIGIN: OnceLock<Regex> = OnceLock::new();
    ORIGIN.get_or_init(|| Regex::new(r"^https?://[^/]+").expect("valid origin pattern"))
}

impl CdnRewrite {
    pub fn apply(&self, url: &str) -> String {
        match self {
            CdnRewrite::None => url.to_string(),
            CdnRewrite::Prepend(base) => format!("{base}{url}"),
            CdnRewrite::ReplaceHost(base) => origin_pattern()
                .replace(url, regex::NoExpand(base.trim_end_matches('/')))
                .into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://videos.example.com/az/files/y.mp4?sig=abc";

    #[test]
    fn none_leaves_url_alone() {
        assert_eq!(CdnRewrite::None.apply(URL), URL);
    }

    #[test]
    fn prepend_concatenates() {
        let rule = CdnRewrite::Prepend("https://proxy.example/".to_string());
        assert_eq!(
            rule.apply(URL),
            "https://proxy.example/https://videos.example.com/az/files/y.mp4?sig=abc"
        );
    }

    #[test]
    fn replace_host_keeps_path_and_query() {
        let rule = CdnRewrite::ReplaceHost("https://cdn.example.net/".to_string());
        assert_eq!(rule.apply(URL), "https://cdn.example.net/az/files/y.mp4?sig=abc");
    }

    #[test]
    fn replace_host_ignores_urls_without_origin() {
        let rule = CdnRewrite::ReplaceHost("https://cdn.example.net".to_string());
        assert_eq!(rule.apply("/relative/y.mp4"), "/relative/y.mp4");
    }
}
