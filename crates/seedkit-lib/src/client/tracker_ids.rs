//! Per-tracker torrent IDs recovered from comments and announce URLs.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

/// Short tracker name → numeric torrent ID on that tracker.
pub type TrackerIds = BTreeMap<&'static str, u64>;

/// Trackers in the order their descriptors are preferred for reuse.
pub const PRIORITY: [&str; 15] = [
    "aither", "ulcx", "lst", "blu", "oe", "btn", "bhd", "huno", "hdb", "rf", "otw", "yus", "dp", "sp", "ptp",
];
/// Rank of a candidate without any known tracker ID.
pub const UNRANKED: usize = 100;

#[derive(Debug, Clone, Copy)]
enum IdLocation {
    /// Trailing path segment, `/torrents/1234`
    LastSegment,
    Query(&'static str),
    /// Path segment following `details/`
    Details,
}

const COMMENT_RULES: [(&str, &str, IdLocation); 15] = [
    ("passthepopcorn.me", "ptp", IdLocation::Query("torrentid")),
    ("aither.cc", "aither", IdLocation::LastSegment),
    ("lst.gg", "lst", IdLocation::LastSegment),
    ("onlyencodes.cc", "oe", IdLocation::LastSegment),
    ("blutopia.cc", "blu", IdLocation::LastSegment),
    ("hawke.uno", "huno", IdLocation::LastSegment),
    ("upload.cx", "ulcx", IdLocation::LastSegment),
    ("reelflix.xyz", "rf", IdLocation::LastSegment),
    ("oldtoons.world", "otw", IdLocation::LastSegment),
    ("yu-scene.net", "yus", IdLocation::LastSegment),
    ("darkpeers.org", "dp", IdLocation::LastSegment),
    ("seedpool.org", "sp", IdLocation::LastSegment),
    ("hdbits.org", "hdb", IdLocation::Query("id")),
    ("broadcasthe.net", "btn", IdLocation::Query("id")),
    ("beyond-hd.me", "bhd", IdLocation::Details),
];

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap_or_else(|e| unreachable!("static regex is valid: {e}")))
}

fn huno_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/torrents/(\d+)").unwrap_or_else(|e| unreachable!("static regex is valid: {e}")))
}

fn is_host(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.'))
}

fn last_segment_id(url: &Url) -> Option<u64> {
    url.path_segments()?.next_back()?.parse().ok()
}

fn query_id(url: &Url, key: &str) -> Option<u64> {
    url.query_pairs().find(|(k, _)| k == key)?.1.parse().ok()
}

fn details_id(url: &Url) -> Option<u64> {
    let mut segments = url.path_segments()?;
    segments.find(|segment| *segment == "details")?;
    segments.next()?.parse().ok()
}

/// Extracts tracker IDs from every URL found in a torrent comment.
pub fn from_comment(comment: &str) -> TrackerIds {
    let mut ids = TrackerIds::new();
    for found in url_re().find_iter(comment) {
        let Ok(url) = Url::parse(found.as_str()) else {
            continue;
        };
        let Some(host) = url.host_str().map(str::to_lowercase) else {
            continue;
        };
        let Some((_, tracker, location)) = COMMENT_RULES.iter().find(|(domain, _, _)| is_host(&host, domain)) else {
            continue;
        };
        let id = match location {
            IdLocation::LastSegment => last_segment_id(&url),
            IdLocation::Query(key) => query_id(&url, key),
            IdLocation::Details => details_id(&url),
        };
        if let Some(id) = id {
            ids.insert(*tracker, id);
        }
    }
    ids
}

/// Adds IDs implied by the announce URL of a working tracker.
pub fn apply_announce_rules(ids: &mut TrackerIds, announce: &str, comment: &str) {
    if announce.contains("hawke.uno") {
        if let Some(id) = huno_re()
            .captures(comment)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            ids.insert("huno", id);
        }
    }
    if announce.contains("tracker.anthelion.me") {
        ids.insert("ant", 1);
    }
}

/// Best (lowest) priority rank over the trackers a candidate has IDs for.
pub fn priority_rank(ids: &TrackerIds) -> usize {
    ids.keys()
        .filter_map(|tracker| PRIORITY.iter().position(|p| p == tracker))
        .min()
        .unwrap_or(UNRANKED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ids_by_host() {
        let ids = from_comment(
            "https://aither.cc/torrents/4242 and https://passthepopcorn.me/torrents.php?id=1&torrentid=99 \
             see also https://beyond-hd.me/details/321 https://hdbits.org/details.php?id=77",
        );
        assert_eq!(ids.get("aither"), Some(&4242));
        assert_eq!(ids.get("ptp"), Some(&99));
        assert_eq!(ids.get("bhd"), Some(&321));
        assert_eq!(ids.get("hdb"), Some(&77));
    }

    #[test]
    fn subdomains_match_but_lookalikes_do_not() {
        assert_eq!(from_comment("https://www.blutopia.cc/torrents/5").get("blu"), Some(&5));
        assert!(from_comment("https://notblutopia.cc/torrents/5").is_empty());
        assert!(from_comment("https://aither.cc/torrents/abc").is_empty());
    }

    #[test]
    fn announce_rules() {
        let mut ids = TrackerIds::new();
        apply_announce_rules(&mut ids, "https://hawke.uno/announce/key", "uploaded at /torrents/812 by someone");
        apply_announce_rules(&mut ids, "https://tracker.anthelion.me/key/announce", "");
        assert_eq!(ids.get("huno"), Some(&812));
        assert_eq!(ids.get("ant"), Some(&1));
    }

    #[test]
    fn ranks_by_best_tracker() {
        let mut ids = TrackerIds::new();
        assert_eq!(priority_rank(&ids), UNRANKED);
        ids.insert("ptp", 1);
        assert_eq!(priority_rank(&ids), 14);
        ids.insert("blu", 1);
        assert_eq!(priority_rank(&ids), 3);
        ids.insert("ant", 1);
        assert_eq!(priority_rank(&ids), 3);
    }
}
