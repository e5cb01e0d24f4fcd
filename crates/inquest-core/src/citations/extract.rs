//! Phase 1: URL extraction from wave `## Sources` sections.

use std::collections::BTreeMap;

use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::citations::{FoundBy, FoundByDoc};
use crate::store;

use super::FOUND_BY_CAP;

/// Extraction result: original URLs in encounter order plus their
/// occurrence map.
#[derive(Debug, Clone, Default)]
pub struct ExtractedUrls {
    /// Unique original URLs, first-encounter order.
    pub urls: Vec<String>,
    /// Occurrences per original URL, sorted, capped at [`FOUND_BY_CAP`].
    pub found_by: BTreeMap<String, Vec<FoundBy>>,
}

fn url_pattern() -> regex::Regex {
    regex::Regex::new(r#"https?://[^\s\)\]>"'`]+"#).expect("static regex")
}

fn trim_trailing_punct(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':'])
}

/// Scan one markdown file's `## Sources` section for URLs.
fn scan_file(
    relative: &str,
    perspective_id: &str,
    wave: u8,
    markdown: &str,
    ordinal: &mut u32,
    out: &mut ExtractedUrls,
) {
    let re = url_pattern();
    let mut in_sources = false;

    for (line_idx, line) in markdown.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            in_sources = trimmed.trim_start_matches('#').trim() == "Sources";
            continue;
        }
        if !in_sources {
            continue;
        }
        for m in re.find_iter(line) {
            let url = trim_trailing_punct(m.as_str()).to_string();
            if url.is_empty() {
                continue;
            }
            if !out.found_by.contains_key(&url) {
                out.urls.push(url.clone());
            }
            let entries = out.found_by.entry(url).or_default();
            if entries.len() < FOUND_BY_CAP {
                entries.push(FoundBy {
                    file: relative.to_string(),
                    perspective_id: perspective_id.to_string(),
                    source_line: (line_idx + 1) as u32,
                    wave,
                    ordinal: *ordinal,
                });
            }
            *ordinal += 1;
        }
    }
}

fn wave_outputs(paths: &RunPaths, wave: u8) -> Result<Vec<(String, String)>> {
    let dir = paths.wave_dir(wave);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .map_err(|e| CoreError::read_failed(&dir, &e))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(".md"))
        .collect();
    names.sort();

    let mut outputs = Vec::new();
    for name in names {
        let stem = name.trim_end_matches(".md").to_string();
        let text = store::read_text(&dir.join(&name))?;
        outputs.push((stem, text));
    }
    Ok(outputs)
}

/// Extract URLs from wave-1 (and wave-2 when present), writing
/// `citations/extracted-urls.txt` and `citations/found-by.json`.
pub fn citations_extract_urls(paths: &RunPaths) -> Result<ExtractedUrls> {
    let mut out = ExtractedUrls::default();
    let mut ordinal = 0u32;

    for wave in [1u8, 2u8] {
        for (perspective_id, markdown) in wave_outputs(paths, wave)? {
            let relative = format!("wave-{wave}/{perspective_id}.md");
            scan_file(&relative, &perspective_id, wave, &markdown, &mut ordinal, &mut out);
        }
    }

    for entries in out.found_by.values_mut() {
        entries.sort();
    }

    let mut text = String::new();
    for url in &out.urls {
        text.push_str(url);
        text.push('\n');
    }
    store::atomic_write_text(&paths.extracted_urls(), &text)?;

    let doc = FoundByDoc {
        schema_version: "found_by.v1".to_string(),
        occurrences: out.found_by.clone(),
    };
    let value = serde_json::to_value(&doc)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize found-by: {e}")))?;
    store::atomic_write_json(&paths.found_by(), &value)?;

    tracing::info!(event = "citations.extracted", urls = out.urls.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_output(paths: &RunPaths, wave: u8, pid: &str, body: &str) {
        std::fs::create_dir_all(paths.wave_dir(wave)).unwrap();
        std::fs::write(paths.wave_output(wave, pid), body).unwrap();
    }

    #[test]
    fn test_extracts_only_sources_section() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_output(
            &paths,
            1,
            "p-A",
            "## Findings\nSee https://ignored.example/in-body\n\n## Sources\n- https://a.example/x\n- https://b.example/y.\n",
        );

        let out = citations_extract_urls(&paths).expect("extract");
        assert_eq!(
            out.urls,
            vec!["https://a.example/x".to_string(), "https://b.example/y".to_string()]
        );
        assert!(paths.extracted_urls().exists());
        assert!(paths.found_by().exists());
    }

    #[test]
    fn test_encounter_order_across_waves() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_output(&paths, 1, "p-A", "## Sources\n- https://a.example/1\n");
        seed_output(&paths, 2, "p-C", "## Sources\n- https://c.example/3\n- https://a.example/1\n");

        let out = citations_extract_urls(&paths).expect("extract");
        assert_eq!(out.urls.len(), 2);
        assert_eq!(out.urls[0], "https://a.example/1");

        let occurrences = &out.found_by["https://a.example/1"];
        assert_eq!(occurrences.len(), 2);
        // Sorted by (file, perspective, source_line).
        assert_eq!(occurrences[0].file, "wave-1/p-A.md");
        assert_eq!(occurrences[1].file, "wave-2/p-C.md");
    }

    #[test]
    fn test_found_by_cap() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        let mut body = String::from("## Sources\n");
        for _ in 0..30 {
            body.push_str("- https://a.example/repeat\n");
        }
        seed_output(&paths, 1, "p-A", &body);

        let out = citations_extract_urls(&paths).expect("extract");
        assert_eq!(out.found_by["https://a.example/repeat"].len(), FOUND_BY_CAP);
    }

    #[test]
    fn test_plan_file_is_ignored() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_output(&paths, 1, "p-A", "## Sources\n- https://a.example/x\n");
        // The plan lives in the same directory but is not a wave output.
        std::fs::write(
            paths.wave_dir(1).join("wave1-plan.json"),
            "{}",
        )
        .unwrap();

        let out = citations_extract_urls(&paths).expect("extract");
        assert_eq!(out.urls.len(), 1);
    }
}
