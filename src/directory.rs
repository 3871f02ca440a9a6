//! Site and release-group directory.
//!
//! Maps tracker hostnames to site nicknames and job names to release groups.
//! Rebuilt from the `sites` table at the start of every reconciliation pass
//! and read-only afterwards.

use crate::client::Tracker;
use crate::db::SiteRow;

use regex::Regex;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::LazyLock;

static HOST_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(www|tracker|kp|pt|t|ipv4|ipv6|on|daydream)\.").expect("valid regex"));

static COMMENT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s/$.?#].[^\s]*").expect("valid regex"));

/// `<prefix>x<id>x<timestamp>x<hash>` as written by some sites.
static COMMENT_TAGGED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+x(\d+)x\d+x[0-9a-zA-Z]+").expect("valid regex"));

static COMMENT_BARE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*$").expect("valid regex"));

/// Substring rules for client lifecycle states, checked in order.
const STATE_LABELS: &[(&str, &str)] = &[
    ("downloading", "downloading"),
    ("forceddl", "downloading"),
    ("metadl", "downloading"),
    ("uploading", "seeding"),
    ("stalledup", "seeding"),
    ("forcedup", "seeding"),
    ("seed", "seeding"),
    ("paused", "paused"),
    ("stopped", "paused"),
    ("stalleddl", "paused"),
    ("checking", "checking"),
    ("check", "checking"),
    ("error", "error"),
    ("missingfiles", "missing_files"),
    ("moving", "moving"),
    ("allocating", "allocating"),
    ("queued", "queued"),
    ("pending", "queued"),
];

/// Reduce a hostname to the label that identifies the site, e.g.
/// `tracker.example.com` and `www.example.co.uk` both give `example`.
pub fn extract_core_domain(hostname: &str) -> Option<String> {
    if hostname.is_empty() {
        return None;
    }

    let stripped = HOST_PREFIX.replace(hostname, "");
    let parts: Vec<&str> = stripped.split('.').collect();
    let n = parts.len();

    let core = if n > 2 && parts[n - 2].len() <= 3 && parts[n - 1].len() <= 3 {
        parts[n - 3]
    } else if n > 1 {
        parts[n - 2]
    } else {
        parts[0]
    };
    Some(core.to_string())
}

/// Hostname of a URL, if it parses.
pub fn hostname_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// Pull the details link or torrent id out of a free-text comment.
///
/// A URL anywhere in the text wins; otherwise the id of a tagged
/// `<prefix>x<id>x<ts>x<hash>` comment; otherwise a comment that is only
/// digits. Anything else yields `None`.
pub fn extract_url_from_comment(comment: &str) -> Option<String> {
    if comment.trim().is_empty() {
        return None;
    }
    if let Some(m) = COMMENT_URL.find(comment) {
        return Some(m.as_str().to_string());
    }
    if let Some(c) = COMMENT_TAGGED_ID.captures(comment) {
        return Some(c[1].to_string());
    }
    COMMENT_BARE_ID.captures(comment).map(|c| c[1].to_string())
}

/// Map a client lifecycle state onto the fixed label set. Unknown states are
/// passed through capitalised.
pub fn normalize_state(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if let Some((_, label)) = STATE_LABELS.iter().find(|(key, _)| lower.contains(key)) {
        return label.to_string();
    }

    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
struct GroupAlias {
    lower: String,
    original: String,
    /// Nickname of the site that lists this group.
    site: String,
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    core_domains: HashMap<String, String>,
    /// Longest alias first.
    groups: Vec<GroupAlias>,
}

impl Directory {
    pub fn from_sites(sites: &[SiteRow]) -> Self {
        let mut core_domains = HashMap::new();
        let mut groups: HashMap<String, GroupAlias> = HashMap::new();

        for site in sites {
            let base_url = site.base_url.trim();
            if site.nickname.is_empty() || base_url.is_empty() {
                continue;
            }

            if let Some(aliases) = &site.groups {
                for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                    groups.insert(
                        alias.to_lowercase(),
                        GroupAlias {
                            lower: alias.to_lowercase(),
                            original: alias.to_string(),
                            site: site.nickname.clone(),
                        },
                    );
                }
            }

            let domains = std::iter::once(base_url).chain(site.special_tracker_domain.as_deref());
            for domain in domains {
                if let Some(core) = site_host(domain).as_deref().and_then(extract_core_domain) {
                    core_domains.insert(core, site.nickname.clone());
                }
            }
        }

        let mut groups: Vec<GroupAlias> = groups.into_values().collect();
        groups.sort_by(|a, b| b.lower.len().cmp(&a.lower.len()).then_with(|| a.lower.cmp(&b.lower)));

        Self { core_domains, groups }
    }

    pub fn is_empty(&self) -> bool {
        self.core_domains.is_empty() && self.groups.is_empty()
    }

    /// Site whose core domain matches `url`'s hostname.
    pub fn site_for_url(&self, url: &str) -> Option<&str> {
        let host = hostname_of(url)?;
        let core = extract_core_domain(&host)?;
        self.core_domains.get(&core).map(String::as_str)
    }

    /// Attribute a job to a site: trackers first, then a URL found in the
    /// comment.
    pub fn site_for(&self, trackers: &[Tracker], comment: &str) -> Option<String> {
        if let Some(site) = trackers.iter().find_map(|t| self.site_for_url(&t.url)) {
            return Some(site.to_string());
        }

        let from_comment = extract_url_from_comment(comment)?;
        let site = self.site_for_url(&from_comment)?;
        tracing::debug!("Directory: matched site {} from comment {}", site, from_comment);
        Some(site.to_string())
    }

    /// Release group whose alias occurs in `name`, case-insensitively. The
    /// longest matching alias wins.
    pub fn group_for(&self, name: &str) -> Option<String> {
        let lower = name.to_lowercase();
        self.groups
            .iter()
            .find(|g| lower.contains(&g.lower))
            .map(|g| g.original.clone())
    }

    /// Site that lists the release group `alias`.
    pub fn group_site(&self, alias: &str) -> Option<&str> {
        let lower = alias.to_lowercase();
        self.groups.iter().find(|g| g.lower == lower).map(|g| g.site.as_str())
    }
}

/// Hostname of a site table entry, which is usually stored without a scheme.
fn site_host(entry: &str) -> Option<String> {
    if entry.contains("://") {
        hostname_of(entry)
    } else {
        hostname_of(&format!("http://{}", entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(nickname: &str, base_url: &str, special: Option<&str>, groups: Option<&str>) -> SiteRow {
        SiteRow {
            nickname: nickname.to_string(),
            base_url: base_url.to_string(),
            special_tracker_domain: special.map(str::to_string),
            groups: groups.map(str::to_string),
        }
    }

    fn tracker(url: &str) -> Tracker {
        Tracker { url: url.to_string() }
    }

    #[test]
    fn test_extract_core_domain() {
        assert_eq!(extract_core_domain("tracker.example.com").as_deref(), Some("example"));
        assert_eq!(extract_core_domain("www.example.co.uk").as_deref(), Some("example"));
        assert_eq!(extract_core_domain("pt.site.com.cn").as_deref(), Some("site"));
        assert_eq!(extract_core_domain("announce.longname.club").as_deref(), Some("longname"));
        assert_eq!(extract_core_domain("localhost").as_deref(), Some("localhost"));
        assert_eq!(extract_core_domain(""), None);
    }

    #[test]
    fn test_extract_url_from_comment() {
        assert_eq!(
            extract_url_from_comment("https://example.com/torrent/12345").as_deref(),
            Some("https://example.com/torrent/12345")
        );
        assert_eq!(
            extract_url_from_comment("see https://example.com/details.php?id=9 for more").as_deref(),
            Some("https://example.com/details.php?id=9")
        );
        assert_eq!(extract_url_from_comment("HDHx122230x1653609725x185205f1").as_deref(), Some("122230"));
        assert_eq!(extract_url_from_comment("  12345 ").as_deref(), Some("12345"));
        assert_eq!(extract_url_from_comment("just words"), None);
        assert_eq!(extract_url_from_comment("   "), None);
    }

    #[test]
    fn test_normalize_state() {
        assert_eq!(normalize_state("stalledUP"), "seeding");
        assert_eq!(normalize_state("uploading"), "seeding");
        assert_eq!(normalize_state("pausedUP"), "paused");
        assert_eq!(normalize_state("stoppedDL"), "paused");
        assert_eq!(normalize_state("checkingResumeData"), "checking");
        assert_eq!(normalize_state("missingFiles"), "missing_files");
        assert_eq!(normalize_state("queuedUP"), "queued");
        assert_eq!(normalize_state("download pending"), "queued");
        assert_eq!(normalize_state("seeding"), "seeding");
        assert_eq!(normalize_state("stopped"), "paused");
        assert_eq!(normalize_state("weird"), "Weird");
        assert_eq!(normalize_state(""), "");
    }

    #[test]
    fn test_site_from_tracker_then_comment() {
        let dir = Directory::from_sites(&[site("SiteX", "example.com", None, None)]);

        assert_eq!(
            dir.site_for(&[tracker("http://tracker.example.com/announce")], "").as_deref(),
            Some("SiteX")
        );
        assert_eq!(
            dir.site_for(&[], "http://example.com/details.php?id=42").as_deref(),
            Some("SiteX")
        );
        assert_eq!(dir.site_for(&[tracker("udp://open.other.org:1337")], "42"), None);
    }

    #[test]
    fn test_special_tracker_domain() {
        let dir = Directory::from_sites(&[site("SiteY", "https://www.sitey.net", Some("tracker.ydomain.io"), None)]);
        assert_eq!(dir.site_for(&[tracker("https://tracker.ydomain.io/a?k=1")], "").as_deref(), Some("SiteY"));
        assert_eq!(dir.site_for(&[tracker("https://sitey.net/a")], "").as_deref(), Some("SiteY"));
    }

    #[test]
    fn test_longest_group_alias_wins() {
        let dir = Directory::from_sites(&[
            site("A", "a.com", None, Some("CMCT, ")),
            site("B", "b.com", None, Some("CMCTV,Other")),
        ]);

        assert_eq!(dir.group_for("Movie.2024.1080p-CMCTV").as_deref(), Some("CMCTV"));
        assert_eq!(dir.group_for("Movie.2024.1080p-cmct").as_deref(), Some("CMCT"));
        assert_eq!(dir.group_for("Nothing.Here"), None);
    }

    #[test]
    fn test_group_alias_carries_owning_site() {
        let dir = Directory::from_sites(&[
            site("A", "a.com", None, Some("CMCT")),
            site("B", "b.com", None, Some("CMCTV,Other")),
        ]);

        assert_eq!(dir.group_site("cmct"), Some("A"));
        assert_eq!(dir.group_site("CMCTV"), Some("B"));
        assert_eq!(dir.group_site("other"), Some("B"));
        assert_eq!(dir.group_site("Missing"), None);
    }

    #[test]
    fn test_incomplete_sites_are_skipped() {
        let dir = Directory::from_sites(&[site("", "a.com", None, Some("G")), site("N", " ", None, None)]);
        assert!(dir.is_empty());
    }
}
