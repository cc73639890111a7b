use std::{sync::Arc, time::Instant};

use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::{
    fetch::Fetcher,
    ledger::{Ledger, Status},
    types::MeetingCounts,
};

// Markup selectors are an adapter detail of the upstream catalog; everything
// below them speaks in locators and counts only.
lazy_static! {
    static ref PAGER_LINK: Selector =
        Selector::parse("ul.pager__items li a.pager__link").expect("static selector is valid");
    static ref SESSION_ROW: Selector =
        Selector::parse("div.views-row").expect("static selector is valid");
    static ref SESSION_ANCHOR: Selector =
        Selector::parse("div.un-box a").expect("static selector is valid");
    static ref MEETING_ITEM: Selector =
        Selector::parse("div.meeting-list-item").expect("static selector is valid");
    static ref PRIVATE_BADGE: Selector = Selector::parse(
        "span.meeting-list-item--visibility[title=\"Private meeting\"]"
    )
    .expect("static selector is valid");
    static ref LISTEN_LINK: Selector =
        Selector::parse("a.button--alt").expect("static selector is valid");
    static ref PAGE_PARAM: Regex = Regex::new(r"page=(\d+)").expect("static regex is valid");
}

/// Paginated discovery over the three-level catalog hierarchy: catalog pages
/// list sessions, session subpages list meetings, meetings point at archives.
///
/// A failed or unparseable page degrades to an empty result for that page,
/// recorded in the ledger; it never aborts the crawl.
pub struct Catalog {
    fetcher: Arc<Fetcher>,
    base_url: String,
    ledger: Arc<Ledger>,
}

impl Catalog {
    pub fn new(fetcher: Arc<Fetcher>, base_url: &str, ledger: Arc<Ledger>) -> Self {
        Catalog {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            ledger,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Total number of pages behind `url`'s pagination control.
    ///
    /// The control links previous numbered pages but never the last page
    /// itself, so the highest linked index is incremented by one. No control
    /// means a single page, as does a failed fetch.
    pub async fn total_pages(&self, url: &str) -> usize {
        let started = Instant::now();

        let body = match self.fetcher.fetch_page(url).await {
            Some(b) => b,
            None => {
                self.ledger
                    .record(url, "", Status::PageCountFailed, started, "request failed");
                return 1;
            }
        };

        let total = match parse_max_linked_page(&body) {
            Some(max) => max + 1,
            None => 1,
        };
        debug!("found {} pages for {}", total, url);
        total
    }

    /// Session locators listed on one catalog page. `None` means the page
    /// itself could not be fetched (as opposed to a page with no sessions).
    pub async fn session_links(&self, page: usize) -> Option<Vec<String>> {
        let url = format!("{}?page={}", self.base_url, page);
        let started = Instant::now();

        let body = match self.fetcher.fetch_page(&url).await {
            Some(b) => b,
            None => {
                self.ledger.record(
                    &url,
                    "",
                    Status::SessionLinksFailed,
                    started,
                    "request failed",
                );
                return None;
            }
        };

        let base_path = Url::parse(&self.base_url)
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        let links = parse_session_links(&body, &self.base_url, &base_path);
        info!("found {} session links on page {}", links.len(), page);
        Some(links)
    }

    /// Audio-resource locators on one session subpage, plus classification
    /// counters for the meeting entries that yielded nothing.
    pub async fn audio_links(
        &self,
        session_url: &str,
        subpage: usize,
    ) -> (Vec<String>, MeetingCounts) {
        let url = format!("{}?page={}", session_url, subpage);
        let started = Instant::now();

        let body = match self.fetcher.fetch_page(&url).await {
            Some(b) => b,
            None => {
                self.ledger.record(
                    &url,
                    "",
                    Status::AudioLinksFailed,
                    started,
                    "request failed",
                );
                return (vec![], MeetingCounts::default());
            }
        };

        let origin = match Url::parse(session_url) {
            Ok(u) => u,
            Err(e) => {
                error!("invalid session url {}: {}", session_url, e);
                return (vec![], MeetingCounts::default());
            }
        };

        let (links, counts) = parse_audio_links(&body, &origin);
        info!(
            "found {} audio links, {} private, {} unavailable out of {} meetings on {}",
            links.len(),
            counts.private,
            counts.unavailable,
            counts.total,
            url
        );
        (links, counts)
    }
}

/// Highest page index the pagination control links to, or `None` when the
/// page carries no control at all.
fn parse_max_linked_page(html: &str) -> Option<usize> {
    let document = Html::parse_document(html);
    let mut links = document.select(&PAGER_LINK).peekable();
    links.peek()?;

    let mut max_page = 0;
    for link in links {
        let href = link.value().attr("href").unwrap_or("");
        if let Some(cap) = PAGE_PARAM.captures(href) {
            if let Ok(page) = cap[1].parse::<usize>() {
                max_page = max_page.max(page);
            }
        }
    }
    Some(max_page)
}

fn parse_session_links(html: &str, base_url: &str, base_path: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = vec![];

    for row in document.select(&SESSION_ROW) {
        let anchor = match row.select(&SESSION_ANCHOR).next() {
            Some(a) => a,
            None => continue,
        };
        let href = match anchor.value().attr("href") {
            Some(h) => h,
            None => continue,
        };
        if base_path.is_empty() || !href.contains(base_path) {
            continue;
        }
        let session_id = match href.trim_end_matches('/').rsplit('/').next() {
            Some(id) if !id.is_empty() => id,
            _ => continue,
        };
        links.push(format!("{}/{}/meetings", base_url, session_id));
    }

    links
}

fn parse_audio_links(html: &str, origin: &Url) -> (Vec<String>, MeetingCounts) {
    let document = Html::parse_document(html);
    let mut links = vec![];
    let mut counts = MeetingCounts::default();

    for meeting in document.select(&MEETING_ITEM) {
        counts.total += 1;

        if meeting.select(&PRIVATE_BADGE).next().is_some() {
            counts.private += 1;
            continue;
        }

        let href = meeting
            .select(&LISTEN_LINK)
            .next()
            .and_then(|a| a.value().attr("href"));
        match href {
            Some(h) => match origin.join(h) {
                Ok(full) => links.push(full.to_string()),
                Err(e) => {
                    warn!("could not resolve audio link {}: {}", h, e);
                    counts.unavailable += 1;
                }
            },
            None => counts.unavailable += 1,
        }
    }

    (links, counts)
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGED: &str = r#"
        <html><body>
        <ul class="pager__items">
            <li><a class="pager__link" href="?page=1">2</a></li>
            <li><a class="pager__link" href="?page=5">6</a></li>
            <li><a class="pager__link" href="?page=3">4</a></li>
        </ul>
        </body></html>"#;

    #[test]
    fn page_count_is_highest_link_plus_one() {
        assert_eq!(parse_max_linked_page(PAGED), Some(5));
    }

    #[test]
    fn no_pagination_control_means_single_page() {
        assert_eq!(parse_max_linked_page("<html><body></body></html>"), None);
    }

    #[test]
    fn pager_without_parseable_indices_still_counts_one_page() {
        let html = r##"<ul class="pager__items"><li><a class="pager__link" href="#">next</a></li></ul>"##;
        // control present but no numeric link: max index stays 0, one page total
        assert_eq!(parse_max_linked_page(html), Some(0));
    }

    #[test]
    fn session_links_are_rebuilt_from_ids() {
        let html = r#"
            <div class="views-row">
                <div class="un-box"><a href="/catalog/en/clients/abc123">A</a></div>
            </div>
            <div class="views-row">
                <div class="un-box"><a href="/elsewhere/xyz">B</a></div>
            </div>
            <div class="views-row"><div class="un-box"><span>no anchor</span></div></div>"#;

        let links = parse_session_links(
            html,
            "https://example.org/catalog/en/clients",
            "/catalog/en/clients",
        );
        assert_eq!(
            links,
            vec!["https://example.org/catalog/en/clients/abc123/meetings"]
        );
    }

    #[test]
    fn meetings_are_classified() {
        let html = r#"
            <div class="meeting-list-item">
                <span class="meeting-list-item--visibility" title="Private meeting"></span>
            </div>
            <div class="meeting-list-item">
                <a class="button--alt" href="/listen/42">Listen</a>
            </div>
            <div class="meeting-list-item">
                <span>no recording</span>
            </div>"#;

        let origin = Url::parse("https://example.org/catalog/en/clients/abc/meetings").unwrap();
        let (links, counts) = parse_audio_links(html, &origin);

        assert_eq!(links, vec!["https://example.org/listen/42"]);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.private, 1);
        assert_eq!(counts.unavailable, 1);
    }
}
