use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::config::Config;

/// One discovered short-horizon binary market.
#[derive(Clone, Debug)]
pub struct MarketInfo {
    pub slug: String,
    pub condition_id: String,
    pub question: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub yes_token_id: String,
    pub no_token_id: String,
}

impl MarketInfo {
    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.end_ms
    }
}

/// Start of the window containing `now_s`.
pub fn current_window_start(now_s: i64, window_secs: i64) -> i64 {
    (now_s / window_secs) * window_secs
}

/// Window starts to track: the current window and the next two.
pub fn upcoming_windows(now_s: i64, window_secs: i64) -> [i64; 3] {
    let current = current_window_start(now_s, window_secs);
    [current, current + window_secs, current + 2 * window_secs]
}

/// Slug format: `{asset}-updown-{interval}-{unix_window_start}`.
pub fn slug_for_window(prefix: &str, window_start_s: i64) -> String {
    format!("{}{}", prefix, window_start_s)
}

fn parse_datetime_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(ts) = s.parse::<i64>() {
        return Some(if ts > 1_000_000_000_000 { ts } else { ts * 1000 });
    }
    None
}

/// Extract YES and NO token IDs from an event's markets array. Handles both
/// the two-market format (one market per outcome) and the single-market
/// format where `outcomes` / `clobTokenIds` are JSON-array strings in
/// matching order.
pub fn extract_token_ids(markets: &[serde_json::Value]) -> (String, String) {
    let mut yes_token = String::new();
    let mut no_token = String::new();

    for market in markets {
        let outcomes_str = market.get("outcomes").and_then(|o| o.as_str()).unwrap_or("");
        let tokens_str = market
            .get("clobTokenIds")
            .and_then(|t| t.as_str())
            .unwrap_or("");

        if let (Ok(outcomes), Ok(tokens)) = (
            serde_json::from_str::<Vec<String>>(outcomes_str),
            serde_json::from_str::<Vec<String>>(tokens_str),
        ) {
            for (outcome, token) in outcomes.iter().zip(tokens.iter()) {
                let lower = outcome.to_lowercase();
                if lower.contains("up") || lower.contains("yes") || lower.contains("higher") {
                    yes_token = token.clone();
                } else if lower.contains("down") || lower.contains("no") || lower.contains("lower")
                {
                    no_token = token.clone();
                }
            }
        }
    }

    if yes_token.is_empty() || no_token.is_empty() {
        // Two-market format: each market carries one outcome label
        for market in markets {
            let outcome = market
                .get("groupItemTitle")
                .or_else(|| market.get("outcome"))
                .and_then(|o| o.as_str())
                .unwrap_or("")
                .to_lowercase();
            let token_id = first_token_id(market);
            if outcome.contains("up") || outcome.contains("yes") || outcome.contains("higher") {
                yes_token = token_id;
            } else if outcome.contains("down") || outcome.contains("no") || outcome.contains("lower")
            {
                no_token = token_id;
            }
        }
    }

    (yes_token, no_token)
}

fn first_token_id(market: &serde_json::Value) -> String {
    match market.get("clobTokenIds") {
        Some(raw) if raw.is_string() => {
            let s = raw.as_str().unwrap_or("");
            if s.starts_with('[') {
                serde_json::from_str::<Vec<String>>(s)
                    .ok()
                    .and_then(|t| t.into_iter().next())
                    .unwrap_or_default()
            } else {
                s.to_string()
            }
        }
        Some(raw) if raw.is_array() => raw
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        _ => String::new(),
    }
}

/// Parse one events-API entry into MarketInfo. Returns Ok(None) when the
/// entry is unusable (no markets, no tokens, no timing).
pub fn parse_event(
    event: &serde_json::Value,
    slug: &str,
    window_ms: i64,
) -> Result<Option<MarketInfo>> {
    let markets = match event.get("markets").and_then(|m| m.as_array()) {
        Some(m) if !m.is_empty() => m,
        _ => return Ok(None),
    };

    let end_ms = event
        .get("endDate")
        .and_then(|s| s.as_str())
        .and_then(parse_datetime_ms)
        .unwrap_or(0);

    // Window start rides on the slug's trailing unix timestamp
    let start_ms = slug
        .rsplit('-')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|ts| if ts > 1_000_000_000_000 { ts } else { ts * 1000 })
        .filter(|&ts| ts > 0)
        .or_else(|| (end_ms > 0).then_some(end_ms - window_ms))
        .unwrap_or(0);

    if start_ms == 0 || end_ms == 0 {
        return Ok(None);
    }

    let (yes_token, no_token) = extract_token_ids(markets);
    if yes_token.is_empty() || no_token.is_empty() {
        debug!(slug, "skipping event without resolvable YES/NO tokens");
        return Ok(None);
    }

    let condition_id = markets[0]
        .get("conditionId")
        .and_then(|c| c.as_str())
        .unwrap_or(slug)
        .to_string();
    let question = event
        .get("question")
        .or_else(|| event.get("title"))
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    Ok(Some(MarketInfo {
        slug: slug.to_string(),
        condition_id,
        question,
        start_ms,
        end_ms,
        yes_token_id: yes_token,
        no_token_id: no_token,
    }))
}

async fn fetch_event_by_slug(
    client: &reqwest::Client,
    gamma_api_url: &str,
    slug: &str,
    window_ms: i64,
) -> Result<Option<MarketInfo>> {
    let url = format!("{}/events?slug={}", gamma_api_url, slug);
    let resp = client.get(&url).send().await?;
    let text = resp.text().await?;
    let events: serde_json::Value = serde_json::from_str(&text)?;
    let events_arr = match events.as_array() {
        Some(arr) if !arr.is_empty() => arr,
        _ => return Ok(None),
    };
    parse_event(&events_arr[0], slug, window_ms)
}

/// Pre-fetched window → market cache. The market feed consumes this; when a
/// window is missing the lookup falls through to inline discovery.
pub struct MarketCache {
    entries: HashMap<i64, MarketInfo>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, window_start_s: i64, market: MarketInfo) {
        self.entries.insert(window_start_s, market);
    }

    pub fn get(&self, window_start_s: i64) -> Option<&MarketInfo> {
        self.entries.get(&window_start_s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop windows that ended before `now_s`.
    pub fn evict_expired(&mut self, now_ms: i64) {
        self.entries.retain(|_, m| m.end_ms >= now_ms);
    }

    /// Fetch any of the current + next two windows not already cached.
    pub async fn prime(&mut self, client: &reqwest::Client, config: &Config, now_s: i64) {
        let window_ms = config.market_window_secs * 1000;
        for window in upcoming_windows(now_s, config.market_window_secs) {
            if self.entries.contains_key(&window) {
                continue;
            }
            let slug = slug_for_window(&config.slug_prefix(), window);
            match fetch_event_by_slug(client, &config.gamma_api_url, &slug, window_ms).await {
                Ok(Some(market)) => {
                    info!(slug = %market.slug, end_ms = market.end_ms, "discovered market");
                    self.entries.insert(window, market);
                }
                Ok(None) => debug!(slug, "no market for window yet"),
                Err(e) => warn!(slug, error = %e, "discovery fetch failed"),
            }
        }
        self.evict_expired(now_s * 1000);
    }

    /// Market for the current window: cache first, inline discovery on miss.
    pub async fn current_market(
        &mut self,
        client: &reqwest::Client,
        config: &Config,
        now_s: i64,
    ) -> Result<MarketInfo> {
        let window = current_window_start(now_s, config.market_window_secs);
        if let Some(market) = self.entries.get(&window) {
            if market.is_live(now_s * 1000) {
                return Ok(market.clone());
            }
        }
        // Inline discovery when the cache has nothing usable
        self.prime(client, config, now_s).await;
        self.entries
            .get(&window)
            .filter(|m| m.is_live(now_s * 1000))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "no active {} {} market for window {}",
                    config.asset_label(),
                    config.interval_label(),
                    window
                )
            })
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: clock mid-window with 900-second windows.
    /// Expected: Current window snaps down to the boundary; upcoming lists
    /// the current and next two windows.
    #[test]
    fn test_window_math() {
        let now = 1_700_000_123; // 1_700_000_100 is not divisible by 900
        let start = current_window_start(now, 900);
        assert_eq!(start, (now / 900) * 900);
        let windows = upcoming_windows(now, 900);
        assert_eq!(windows[1] - windows[0], 900);
        assert_eq!(windows[2] - windows[0], 1800);
    }

    /// Scenario: slug assembly from prefix and window start.
    /// Expected: "{prefix}{unix}".
    #[test]
    fn test_slug_for_window() {
        assert_eq!(
            slug_for_window("btc-updown-15m-", 1_700_000_100),
            "btc-updown-15m-1700000100"
        );
    }

    /// Scenario: single-market event with outcomes/clobTokenIds as JSON-array
    /// strings, Up listed first.
    /// Expected: Tokens mapped by outcome order.
    #[test]
    fn test_extract_tokens_array_format() {
        let markets = vec![serde_json::json!({
            "outcomes": "[\"Up\", \"Down\"]",
            "clobTokenIds": "[\"tok-up-1\", \"tok-down-2\"]",
        })];
        let (yes, no) = extract_token_ids(&markets);
        assert_eq!(yes, "tok-up-1");
        assert_eq!(no, "tok-down-2");
    }

    /// Scenario: two-market event, each with a groupItemTitle and one token.
    /// Expected: Tokens mapped by title keywords.
    #[test]
    fn test_extract_tokens_two_market_format() {
        let markets = vec![
            serde_json::json!({"groupItemTitle": "Up", "clobTokenIds": "tok-a"}),
            serde_json::json!({"groupItemTitle": "Down", "clobTokenIds": "tok-b"}),
        ];
        let (yes, no) = extract_token_ids(&markets);
        assert_eq!(yes, "tok-a");
        assert_eq!(no, "tok-b");
    }

    /// Scenario: full event JSON with endDate and a slug-borne window start.
    /// Expected: MarketInfo with start from slug, end from endDate.
    #[test]
    fn test_parse_event() {
        let event = serde_json::json!({
            "title": "Bitcoin Up or Down",
            "endDate": "2026-01-15T10:45:00Z",
            "markets": [{
                "conditionId": "0xabc",
                "outcomes": "[\"Up\", \"Down\"]",
                "clobTokenIds": "[\"t1\", \"t2\"]",
            }],
        });
        let slug = "btc-updown-15m-1768473000";
        let market = parse_event(&event, slug, 900_000).unwrap().unwrap();
        assert_eq!(market.slug, slug);
        assert_eq!(market.condition_id, "0xabc");
        assert_eq!(market.start_ms, 1_768_473_000_000);
        assert_eq!(market.yes_token_id, "t1");
        assert_eq!(market.no_token_id, "t2");
        assert!(market.end_ms > market.start_ms);
    }

    /// Scenario: event whose markets carry no resolvable tokens.
    /// Expected: parse_event yields Ok(None), not an error.
    #[test]
    fn test_parse_event_unusable() {
        let event = serde_json::json!({
            "endDate": "2026-01-15T10:45:00Z",
            "markets": [{"outcomes": "[\"Maybe\"]", "clobTokenIds": "[\"t\"]"}],
        });
        let parsed = parse_event(&event, "btc-updown-15m-1768473000", 900_000).unwrap();
        assert!(parsed.is_none());
    }

    /// Scenario: cache holding an expired and a live market.
    /// Expected: evict_expired drops only the ended one.
    #[test]
    fn test_cache_eviction() {
        let mut cache = MarketCache::new();
        let mk = |end_ms: i64| MarketInfo {
            slug: "s".into(),
            condition_id: "c".into(),
            question: String::new(),
            start_ms: 0,
            end_ms,
            yes_token_id: "y".into(),
            no_token_id: "n".into(),
        };
        cache.insert(0, mk(1000));
        cache.insert(900, mk(2_000_000));
        cache.evict_expired(1_000_000);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(900).is_some());
    }
}
