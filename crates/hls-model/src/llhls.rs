//! Low-Latency HLS blocking-reload wire helpers.
//!
//! A blocking reload strips the query component of the playlist URL and
//! appends `_HLS_msn` (required), then optionally `_HLS_part`, `_HLS_push`
//! and `_HLS_skip=YES`. Servers may embed the same directives in the URLs
//! they hand out; those are parsed back into [`PushInfo`].

use url::Url;

/// Blocking-reload hints embedded in a playlist's own URL
/// (`_HLS_push=1` plus the sequence the server will push).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushInfo {
    pub msn: u64,
    pub part: Option<u64>,
}

/// Query directives for one blocking playlist request.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingReloadQuery {
    /// `_HLS_msn`: the media sequence number the server should block for.
    pub msn: u64,
    /// `_HLS_part`: only meaningful together with `msn`.
    pub part: Option<u64>,
    /// `_HLS_push`: ask the server to push the segment alongside.
    pub push: Option<bool>,
    /// `_HLS_skip=YES`: request a delta update.
    pub skip: bool,
}

/// Build the blocking-reload URL for `base`, replacing any existing query.
pub fn blocking_reload_url(base: &Url, query: &BlockingReloadQuery) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("_HLS_msn", &query.msn.to_string());
        if let Some(part) = query.part {
            pairs.append_pair("_HLS_part", &part.to_string());
        }
        if let Some(push) = query.push {
            pairs.append_pair("_HLS_push", if push { "1" } else { "0" });
        }
        if query.skip {
            pairs.append_pair("_HLS_skip", "YES");
        }
    }
    url
}

/// Parse `_HLS_msn`/`_HLS_part`/`_HLS_push` out of an incoming playlist URL.
///
/// Returns `Some` only when the URL advertises `_HLS_push=1` together with
/// a valid `_HLS_msn`.
pub fn parse_push_info(url: &Url) -> Option<PushInfo> {
    let mut msn: Option<u64> = None;
    let mut part: Option<u64> = None;
    let mut push = false;
    for (key, val) in url.query_pairs() {
        match key.as_ref() {
            "_HLS_msn" => msn = val.parse().ok(),
            "_HLS_part" => part = val.parse().ok(),
            "_HLS_push" => push = val.as_ref() == "1",
            _ => {}
        }
    }
    if !push {
        return None;
    }
    msn.map(|msn| PushInfo { msn, part })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_url_strips_existing_query() {
        let base = Url::parse("https://a.example/l.m3u8?token=abc").unwrap();
        let url = blocking_reload_url(
            &base,
            &BlockingReloadQuery {
                msn: 43,
                ..Default::default()
            },
        );
        assert_eq!(url.as_str(), "https://a.example/l.m3u8?_HLS_msn=43");
    }

    #[test]
    fn blocking_url_orders_optional_directives() {
        let base = Url::parse("https://a.example/l.m3u8").unwrap();
        let url = blocking_reload_url(
            &base,
            &BlockingReloadQuery {
                msn: 43,
                part: Some(2),
                push: Some(true),
                skip: true,
            },
        );
        assert_eq!(
            url.as_str(),
            "https://a.example/l.m3u8?_HLS_msn=43&_HLS_part=2&_HLS_push=1&_HLS_skip=YES"
        );
    }

    #[test]
    fn push_info_requires_push_flag_and_msn() {
        let with_push =
            Url::parse("https://a.example/l.m3u8?_HLS_msn=7&_HLS_part=1&_HLS_push=1").unwrap();
        assert_eq!(
            parse_push_info(&with_push),
            Some(PushInfo {
                msn: 7,
                part: Some(1)
            })
        );

        let without_push = Url::parse("https://a.example/l.m3u8?_HLS_msn=7").unwrap();
        assert_eq!(parse_push_info(&without_push), None);

        let push_disabled = Url::parse("https://a.example/l.m3u8?_HLS_msn=7&_HLS_push=0").unwrap();
        assert_eq!(parse_push_info(&push_disabled), None);

        let push_without_msn = Url::parse("https://a.example/l.m3u8?_HLS_push=1").unwrap();
        assert_eq!(parse_push_info(&push_without_msn), None);
    }
}
