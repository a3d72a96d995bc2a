use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{CandidateItem, NewsSource};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}
#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let odt = OffsetDateTime::parse(ts.trim(), &Rfc2822).ok()?;
    DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), 0)
}

/// One configured feed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
}

impl FeedSpec {
    /// Derive a display name from the URL host (used for feeds given via env).
    pub fn from_url(url: &str) -> Self {
        let name = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_else(|| url.to_string());
        Self {
            name,
            url: url.to_string(),
        }
    }
}

pub struct RssSource {
    mode: Mode,
}

enum Mode {
    // (feed name, raw xml)
    Fixture(Vec<(String, String)>),
    Http {
        feeds: Vec<FeedSpec>,
        client: reqwest::Client,
    },
}

impl RssSource {
    pub fn from_fixture_str(name: &str, xml: &str) -> Self {
        Self {
            mode: Mode::Fixture(vec![(name.to_string(), xml.to_string())]),
        }
    }

    pub fn from_feeds(feeds: Vec<FeedSpec>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("newsdrip/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("building rss http client")?;
        Ok(Self {
            mode: Mode::Http { feeds, client },
        })
    }

    fn parse_items_from_str(feed_name: &str, s: &str) -> Result<Vec<CandidateItem>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;

        let source = if feed_name.is_empty() {
            rss.channel.title.clone().unwrap_or_default()
        } else {
            feed_name.to_string()
        };

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let key = it
                .link
                .filter(|l| !l.trim().is_empty())
                .or_else(|| it.guid.and_then(|g| g.value))
                .unwrap_or_default();
            if key.trim().is_empty() {
                continue;
            }
            out.push(CandidateItem {
                key,
                title: crate::ingest::normalize_text(it.title.as_deref().unwrap_or_default()),
                excerpt: crate::ingest::normalize_text(
                    it.description.as_deref().unwrap_or_default(),
                ),
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                source: source.clone(),
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("newsdrip_rss_parse_ms").record(ms);
        Ok(out)
    }
}

/// Newest first, capped, then flipped so the oldest kept item is enqueued first.
fn select_latest(mut items: Vec<CandidateItem>, max_items: usize) -> Vec<CandidateItem> {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    items.truncate(max_items);
    items.reverse();
    items
}

#[async_trait]
impl NewsSource for RssSource {
    async fn fetch(&self, max_items: usize) -> Result<Vec<CandidateItem>> {
        let mut all = Vec::new();
        match &self.mode {
            Mode::Fixture(docs) => {
                for (name, xml) in docs {
                    all.extend(Self::parse_items_from_str(name, xml)?);
                }
            }
            Mode::Http { feeds, client } => {
                let mut failures = 0usize;
                for feed in feeds {
                    let body = match client.get(&feed.url).send().await {
                        Ok(resp) => match resp.error_for_status() {
                            Ok(ok) => ok.text().await.context("rss http .text()"),
                            Err(e) => Err(anyhow!(e)),
                        },
                        Err(e) => Err(anyhow!(e)),
                    };
                    match body.and_then(|b| Self::parse_items_from_str(&feed.name, &b)) {
                        Ok(items) => all.extend(items),
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(target: "ingest", error = ?e, feed = %feed.name, "feed error");
                            counter!("newsdrip_feed_errors_total").increment(1);
                        }
                    }
                }
                if !feeds.is_empty() && failures == feeds.len() {
                    anyhow::bail!("all {} feeds failed", feeds.len());
                }
            }
        }
        Ok(select_latest(all, max_items))
    }

    fn name(&self) -> &'static str {
        "rss"
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
