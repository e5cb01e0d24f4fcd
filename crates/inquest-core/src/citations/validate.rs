//! Phase 3: citation validation, offline fixtures or the online ladder.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;

use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_eval::ExtractorEndpoints;
use crate::paths::RunPaths;
use crate::schema::citations::{
    BlockedUrl, BlockedUrlsDoc, CitationRecord, CitationStatus, FoundBy, OnlineFixtures,
    OnlineOutcome, UrlMap, BLOCKED_URLS_SCHEMA, ONLINE_FIXTURES_SCHEMA,
};
use crate::schema::policy::CitationsLadderPolicy;
use crate::store;

use super::normalize::normalize_url;
use super::{write_citations, FOUND_BY_CAP};

/// How citations get classified.
#[derive(Debug, Clone)]
pub enum CitationsMode {
    /// Fixture-only replay; a URL without a fixture is `invalid`.
    Offline { fixture_path: PathBuf },
    /// Deterministic classification without touching the network.
    OnlineDryRun,
    /// Live tiered ladder: direct fetch, then configured endpoints.
    OnlineLive { endpoints: ExtractorEndpoints },
}

impl CitationsMode {
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Offline { .. })
    }
}

/// Result of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub blocked: usize,
}

fn load_fixtures(path: &PathBuf) -> Result<OnlineFixtures> {
    let value = store::read_json(path)?;
    serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("citation fixtures do not parse: {e}")))
}

fn found_by_for(
    occurrences: &BTreeMap<String, Vec<FoundBy>>,
    normalized_url: &str,
) -> Vec<FoundBy> {
    let mut entries: Vec<FoundBy> = occurrences
        .iter()
        .filter(|(original, _)| {
            normalize_url(original)
                .map(|n| n.normalized == normalized_url)
                .unwrap_or(false)
        })
        .flat_map(|(_, found)| found.iter().cloned())
        .collect();
    entries.sort();
    entries.truncate(FOUND_BY_CAP);
    entries
}

/// Classify an HTTP status code.
fn classify_http(status: u16) -> CitationStatus {
    match status {
        200..=299 => CitationStatus::Valid,
        401 | 403 | 407 | 429 | 451 => CitationStatus::Blocked,
        _ => CitationStatus::Invalid,
    }
}

// ---------------------------------------------------------------------------
// Online ladder
// ---------------------------------------------------------------------------

struct Tier<'a> {
    name: &'static str,
    endpoint: Option<&'a str>,
    timeout_ms: u64,
    max_attempts: u32,
}

async fn fetch_tier(
    client: &reqwest::Client,
    tier: &Tier<'_>,
    url: &str,
    policy: &CitationsLadderPolicy,
) -> Option<OnlineOutcome> {
    for attempt in 0..tier.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(policy.backoff_ms(attempt - 1)))
                .await;
        }

        let target = match tier.endpoint {
            // Extraction endpoints take the target URL as a query param.
            Some(endpoint) => format!("{endpoint}?url={}", urlencode(url)),
            None => url.to_string(),
        };
        let request = client
            .get(&target)
            .timeout(std::time::Duration::from_millis(tier.timeout_ms));

        match request.send().await {
            Ok(response) => {
                let http_status = response.status().as_u16();
                let status = classify_http(http_status);
                // Cap how much body is read for title sniffing.
                let title = match response.bytes().await {
                    Ok(bytes) => {
                        let capped = &bytes[..bytes.len().min(policy.max_body_bytes as usize)];
                        sniff_title(capped)
                    }
                    Err(_) => None,
                };
                return Some(OnlineOutcome {
                    status,
                    http_status: Some(http_status),
                    title,
                    tier: Some(tier.name.to_string()),
                    notes: String::new(),
                });
            }
            Err(err) => {
                tracing::warn!(
                    event = "citations.tier_attempt_failed",
                    tier = tier.name,
                    url = %url,
                    attempt = attempt + 1,
                    error = %err,
                );
            }
        }
    }
    None
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn sniff_title(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let lower = text.to_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = lower[start..].find("</title>")? + start;
    let title = text[start..end].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Walk the ladder for one URL: direct fetch, Bright Data, Apify.
///
/// A tier that cannot produce a response falls through to the next; a
/// `blocked` classification also tries the next tier before standing.
async fn run_ladder(
    url: &str,
    endpoints: &ExtractorEndpoints,
    policy: &CitationsLadderPolicy,
) -> OnlineOutcome {
    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(policy.max_redirects as usize))
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            return OnlineOutcome {
                status: CitationStatus::Invalid,
                http_status: None,
                title: None,
                tier: None,
                notes: format!("http client unavailable: {err}"),
            }
        }
    };

    let tiers = [
        Tier {
            name: "direct",
            endpoint: None,
            timeout_ms: policy.direct_fetch_timeout_ms,
            max_attempts: policy.direct_fetch_max_attempts,
        },
        Tier {
            name: "bright_data",
            endpoint: endpoints.bright_data.as_deref(),
            timeout_ms: policy.endpoint_timeout_ms,
            max_attempts: policy.bright_data_max_attempts,
        },
        Tier {
            name: "apify",
            endpoint: endpoints.apify.as_deref(),
            timeout_ms: policy.endpoint_timeout_ms,
            max_attempts: policy.apify_max_attempts,
        },
    ];

    let mut last_blocked: Option<OnlineOutcome> = None;
    for tier in &tiers {
        if tier.name != "direct" && tier.endpoint.is_none() {
            continue;
        }
        if let Some(outcome) = fetch_tier(&client, tier, url, policy).await {
            match outcome.status {
                CitationStatus::Blocked => last_blocked = Some(outcome),
                _ => return outcome,
            }
        }
    }

    last_blocked.unwrap_or(OnlineOutcome {
        status: CitationStatus::Invalid,
        http_status: None,
        title: None,
        tier: None,
        notes: "all ladder tiers exhausted".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Validation entry point
// ---------------------------------------------------------------------------

/// Validate every URL in the map and write `citations.jsonl` plus the
/// online artifacts where the mode calls for them.
pub async fn citations_validate(
    paths: &RunPaths,
    map: &UrlMap,
    occurrences: &BTreeMap<String, Vec<FoundBy>>,
    mode: &CitationsMode,
    policy: &CitationsLadderPolicy,
) -> Result<ValidationSummary> {
    let fixtures = match mode {
        CitationsMode::Offline { fixture_path } => Some(load_fixtures(fixture_path)?),
        _ => None,
    };

    // Offline replay is fully deterministic, timestamps included.
    let now = match &fixtures {
        Some(f) => f.generated_at,
        None => Utc::now(),
    };
    let mut records: Vec<CitationRecord> = Vec::new();
    let mut online_outcomes: BTreeMap<String, OnlineOutcome> = BTreeMap::new();
    let mut blocked: Vec<BlockedUrl> = Vec::new();

    for entry in &map.entries {
        let normalized = normalize_url(&entry.url_original)?;

        let outcome = if normalized.had_userinfo {
            // Credentials in a source URL are never fetched or trusted.
            OnlineOutcome {
                status: CitationStatus::Invalid,
                http_status: None,
                title: None,
                tier: None,
                notes: "userinfo redacted from original URL".to_string(),
            }
        } else {
            match mode {
                CitationsMode::Offline { .. } => {
                    let fixtures = fixtures.as_ref().expect("loaded above");
                    fixtures
                        .outcomes
                        .get(&entry.normalized_url)
                        .cloned()
                        .unwrap_or(OnlineOutcome {
                            status: CitationStatus::Invalid,
                            http_status: None,
                            title: None,
                            tier: None,
                            notes: "no offline fixture for URL".to_string(),
                        })
                }
                CitationsMode::OnlineDryRun => OnlineOutcome {
                    status: CitationStatus::Valid,
                    http_status: None,
                    title: None,
                    tier: Some("dry-run".to_string()),
                    notes: "deterministic dry-run classification".to_string(),
                },
                CitationsMode::OnlineLive { endpoints } => {
                    run_ladder(&entry.normalized_url, endpoints, policy).await
                }
            }
        };

        if mode.is_online() {
            online_outcomes.insert(entry.normalized_url.clone(), outcome.clone());
        }
        if outcome.status == CitationStatus::Blocked {
            blocked.push(BlockedUrl {
                cid: entry.cid.clone(),
                normalized_url: entry.normalized_url.clone(),
                reason: outcome
                    .http_status
                    .map(|s| format!("http {s}"))
                    .unwrap_or_else(|| "blocked by extractor".to_string()),
                action: None,
            });
        }

        records.push(CitationRecord {
            cid: entry.cid.clone(),
            normalized_url: entry.normalized_url.clone(),
            url: normalized.display,
            url_original: entry.url_original.clone(),
            status: outcome.status,
            checked_at: now,
            found_by: found_by_for(occurrences, &entry.normalized_url),
            http_status: outcome.http_status,
            title: outcome.title,
            publisher: None,
            evidence_snippet: None,
            notes: outcome.notes,
        });
    }

    write_citations(paths, &mut records)?;

    if mode.is_online() {
        let fixtures_doc = OnlineFixtures {
            schema_version: ONLINE_FIXTURES_SCHEMA.to_string(),
            generated_at: now,
            outcomes: online_outcomes,
        };
        let value = serde_json::to_value(&fixtures_doc)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize fixtures: {e}")))?;
        let stamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        store::atomic_write_json(&paths.online_fixtures_stamped(&stamp), &value)?;
        store::atomic_write_json(&paths.online_fixtures_latest(), &value)?;

        let blocked_doc = BlockedUrlsDoc {
            schema_version: BLOCKED_URLS_SCHEMA.to_string(),
            generated_at: now,
            blocked: blocked.clone(),
        };
        let value = serde_json::to_value(&blocked_doc)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize blocked: {e}")))?;
        store::atomic_write_json(&paths.blocked_urls(), &value)?;

        if !blocked.is_empty() {
            let mut md = String::from("# Blocked URLs\n\nEach entry needs an explicit operator action.\n\n");
            for b in &blocked {
                md.push_str(&format!("- `{}` {} ({})\n", b.cid, b.normalized_url, b.reason));
            }
            store::atomic_write_text(&paths.blocked_urls_queue(), &md)?;
        }
    }

    let summary = ValidationSummary {
        total: records.len(),
        valid: records.iter().filter(|r| r.status == CitationStatus::Valid).count(),
        invalid: records.iter().filter(|r| r.status == CitationStatus::Invalid).count(),
        blocked: records.iter().filter(|r| r.status == CitationStatus::Blocked).count(),
    };
    tracing::info!(
        event = "citations.validated",
        total = summary.total,
        valid = summary.valid,
        blocked = summary.blocked,
    );
    Ok(summary)
}
