//! Egress proxy pool.
//!
//! Keeps a flat list of `http://host:port` candidates fetched from an external
//! listing and hands one out at random per resolution attempt. The whole list
//! is replaced on every refresh; individual entries carry no health state and
//! are never evicted.

use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::http_client;

/// `host:port` anywhere in the listing body.
static HOST_PORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:\d{1,3}\.){3}\d{1,3}|[A-Za-z0-9][A-Za-z0-9-]*(?:\.[A-Za-z0-9][A-Za-z0-9-]*)+):(\d{1,5})\b")
        .unwrap()
});

/// One `<tr>` of a table listing.
static TABLE_ROW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());

/// A `<td>` or `<th>` cell: tag name, attributes, content.
static TABLE_CELL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<(td|th)([^>]*)>(.*?)</t[dh]>"#).unwrap());

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Listing to fetch candidates from. `None` disables refreshing.
    pub listing_url: Option<String>,
    /// Interval between two refreshes.
    pub refresh_interval: Duration,
    /// Upper bound on the number of kept candidates.
    pub max_entries: Option<usize>,
    /// Fixed proxies used when no listing is configured.
    pub static_proxies: Vec<String>,
    /// Timeout for the listing request.
    pub request_timeout: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            listing_url: None,
            refresh_interval: Duration::from_secs(60 * 60),
            max_entries: None,
            static_proxies: Vec::new(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Refreshable set of egress proxies.
pub struct ProxyPool {
    config: ProxyPoolConfig,
    client: reqwest::Client,
    entries: RwLock<Vec<String>>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        let client = http_client::build_client(Some(config.request_timeout));

        let initial: Vec<String> = config
            .static_proxies
            .iter()
            .filter_map(|p| normalize_proxy(p))
            .collect();

        Self {
            config,
            client,
            entries: RwLock::new(initial),
        }
    }

    /// A pool with no listing and no static entries. `pick` always yields `None`.
    pub fn disabled() -> Self {
        Self::new(ProxyPoolConfig::default())
    }

    /// Whether a listing source is configured.
    pub fn has_listing(&self) -> bool {
        self.config.listing_url.is_some()
    }

    /// Fetch the listing and replace the whole candidate set.
    ///
    /// Network or parse failures leave the pool empty; they are logged and
    /// never returned. Returns the new pool size.
    pub async fn refresh(&self) -> usize {
        let Some(url) = self.config.listing_url.as_deref() else {
            return self.len();
        };

        let candidates = match self.fetch_listing(url).await {
            Ok(body) => parse_listing(&body, self.config.max_entries),
            Err(error) => {
                warn!(url = %url, error = %error, "Proxy listing refresh failed");
                Vec::new()
            }
        };

        if candidates.is_empty() {
            warn!(url = %url, "Proxy listing yielded no candidates");
        }

        self.replace(candidates)
    }

    async fn fetch_listing(&self, url: &str) -> reqwest::Result<String> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    /// Replace the candidate set wholesale. Returns the new size.
    pub fn replace(&self, entries: Vec<String>) -> usize {
        let len = entries.len();
        *self.entries.write() = entries;
        len
    }

    /// One candidate chosen uniformly at random, or `None` if the pool is empty.
    pub fn pick(&self) -> Option<String> {
        let entries = self.entries.read();
        let mut rng = rand::rng();
        entries.choose(&mut rng).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Refresh once now, then on every interval until cancelled.
    ///
    /// Returns `None` when no listing is configured.
    pub fn start_refresh_task(
        self: &Arc<Self>,
        cancel_token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.has_listing() {
            debug!("No proxy listing configured; refresh task not started");
            return None;
        }

        let pool = Arc::clone(self);
        let interval = self.config.refresh_interval;

        Some(tokio::spawn(async move {
            loop {
                let count = pool.refresh().await;
                info!(count, "Proxy pool refreshed");

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Proxy refresh task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }))
    }
}

/// Turn a listing body into `http://host:port` candidates.
///
/// Table rows put the address and the port in their first two cells. Rows
/// whose HTTPS column (a `Https` header or an `hx` cell) says `no` are
/// dropped, also when the same address shows up again as plain text.
/// Duplicates are dropped keeping first-seen order; invalid addresses and
/// ports are skipped.
pub fn parse_listing(body: &str, max_entries: Option<usize>) -> Vec<String> {
    let (table_pairs, rejected) = parse_table_rows(body);
    let inline_pairs = HOST_PORT_REGEX
        .captures_iter(body)
        .map(|c| (c[1].to_string(), c[2].to_string()));

    let mut out: Vec<String> = Vec::new();
    for (host, port) in table_pairs.into_iter().chain(inline_pairs) {
        if max_entries.is_some_and(|max| out.len() >= max) {
            break;
        }
        let Some(entry) = build_entry(&host, &port) else {
            continue;
        };
        if !rejected.contains(&entry) && !out.contains(&entry) {
            out.push(entry);
        }
    }
    out
}

/// Returns the `(host, port)` pairs of HTTPS-capable rows and the entries of
/// rows marked as not supporting HTTPS.
fn parse_table_rows(body: &str) -> (Vec<(String, String)>, Vec<String>) {
    let mut https_column: Option<usize> = None;
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for row in TABLE_ROW_REGEX.captures_iter(body) {
        let cells: Vec<(bool, String, String)> = TABLE_CELL_REGEX
            .captures_iter(&row[1])
            .map(|c| {
                let is_header = c[1].eq_ignore_ascii_case("th");
                (is_header, c[2].to_ascii_lowercase(), c[3].trim().to_string())
            })
            .collect();

        if cells.iter().any(|(is_header, _, _)| *is_header) {
            https_column = cells
                .iter()
                .position(|(_, _, text)| text.eq_ignore_ascii_case("https"));
            continue;
        }
        let [(_, _, host), (_, _, port), ..] = cells.as_slice() else {
            continue;
        };

        let https = cells
            .iter()
            .find(|(_, attrs, _)| attrs.contains("hx"))
            .or_else(|| https_column.and_then(|i| cells.get(i)))
            .map(|(_, _, text)| text.as_str());

        if https.is_some_and(|v| v.eq_ignore_ascii_case("no")) {
            if let Some(entry) = build_entry(host, port) {
                rejected.push(entry);
            }
        } else {
            accepted.push((host.clone(), port.clone()));
        }
    }
    (accepted, rejected)
}

fn build_entry(host: &str, port: &str) -> Option<String> {
    let port: u16 = port.parse().ok().filter(|p| *p != 0)?;
    let looks_numeric = host.chars().all(|c| c.is_ascii_digit() || c == '.');
    if looks_numeric && host.parse::<Ipv4Addr>().is_err() {
        return None;
    }
    Some(format!("http://{host}:{port}"))
}

/// Accept `host:port` or a full proxy URL from configuration.
fn normalize_proxy(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains("://") {
        return Some(raw.to_string());
    }
    let (host, port) = raw.rsplit_once(':')?;
    build_entry(host, port)
}
