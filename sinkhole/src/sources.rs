// Copyright 2024 The sinkhole contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Source ingestion: hosts files, regex lists, and JSON records, loaded
//! from files, directories, or HTTP(S) URLs. Fetched bodies are kept in
//! the cache directory so a dead mirror does not lose the list.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use smatcher::{Record, RecordKind};
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

/// Load every record from the given locations. Sources that fail to load
/// are logged and skipped; a bad list should not keep the resolver down.
pub async fn records(locations: &[String], cache_dir: Option<&Path>) -> Vec<Record> {
    let mut records = Vec::new();
    for location in locations {
        match load(location, cache_dir).await {
            Ok(batch) => {
                debug!("loaded {} records from {}", batch.len(), location);
                records.extend(batch);
            }
            Err(e) => warn!("skipping source {}: {}", location, e),
        }
    }
    records
}

async fn load(location: &str, cache_dir: Option<&Path>) -> Result<Vec<Record>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let body = fetch(location, cache_dir).await?;
        return Ok(parse(&body, location));
    }

    let path = Path::new(location);
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", location))?;

    let mut records = Vec::new();
    if meta.is_dir() {
        for file in walk(path)? {
            let body = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            records.extend(parse(&body, &file.to_string_lossy()));
        }
    } else {
        let body = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", location))?;
        records.extend(parse(&body, location));
    }
    Ok(records)
}

// Recursively collect the files under a directory.
fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("cannot read directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

async fn fetch(url: &str, cache_dir: Option<&Path>) -> Result<String> {
    let cached = cache_dir.map(|dir| dir.join(cached_name(url)));

    let fetched = match reqwest::get(url).await {
        Ok(resp) => match resp.error_for_status() {
            Ok(resp) => resp.text().await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    };

    match fetched {
        Ok(body) => {
            if let Some(path) = &cached {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(path, &body).await {
                    warn!("failed to persist {} to {}: {}", url, path.display(), e);
                }
            }
            Ok(body)
        }
        Err(e) => {
            // Fall back to the last fetched copy when there is one.
            if let Some(path) = cached {
                if path.exists() {
                    warn!("fetching {} failed ({}), using cached copy", url, e);
                    return tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("cannot read {}", path.display()));
                }
            }
            Err(e)
        }
    }
}

// The on-disk name of a fetched source: path separators become
// underscores.
fn cached_name(url: &str) -> String {
    url.chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect()
}

fn parse(body: &str, location: &str) -> Vec<Record> {
    if location.ends_with(".regex") {
        parse_regex_list(body, location)
    } else if location.ends_with(".json") {
        match parse_json(body, location) {
            Ok(records) => records,
            Err(e) => {
                warn!("bad JSON source {}: {}", location, e);
                Vec::new()
            }
        }
    } else {
        parse_hosts(body, location)
    }
}

// Hosts file lines: `<ip> <name1> [<name2> …] [# comment]`. Multiple names
// per line are allowed; unparseable lines are dropped.
fn parse_hosts(body: &str, source: &str) -> Vec<Record> {
    let mut records = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (line, comment) = match line.find('#') {
            Some(i) => (line[..i].trim(), Some(line[i + 1..].trim().to_string())),
            None => (line, None),
        };

        let mut cols = line.split_whitespace();
        let ip: IpAddr = match cols.next().and_then(|c| c.parse().ok()) {
            Some(ip) => ip,
            None => continue,
        };

        for name in cols {
            let mut record = Record::new(name, RecordKind::Direct).with_ip(ip);
            record.source = Some(source.to_string());
            record.comment = comment.clone();
            records.push(record);
        }
    }
    records
}

// Regex list lines: one pattern per line, `#` starts a comment. Patterns
// are compiled later by the matcher, which logs and skips the broken ones.
fn parse_regex_list(body: &str, source: &str) -> Vec<Record> {
    let mut records = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = match line.find('#') {
            Some(i) => line[..i].trim(),
            None => line,
        };

        let mut record = Record::new(line, RecordKind::Regex);
        record.source = Some(source.to_string());
        records.push(record);
    }
    records
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Record),
    Many(Vec<Record>),
}

fn parse_json(body: &str, source: &str) -> Result<Vec<Record>> {
    let mut records = match serde_json::from_str(body)? {
        OneOrMany::One(record) => vec![record],
        OneOrMany::Many(records) => records,
    };

    for record in &mut records {
        if record.source.is_none() {
            record.source = Some(source.to_string());
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::{cached_name, parse_hosts, parse_json, parse_regex_list};
    use smatcher::RecordKind;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn hosts_lines() {
        let body = "\
# header comment
0.0.0.0 ads.example tracker.example # telemetry
10.0.0.1 router.lan

not-an-ip name.example
";
        let records = parse_hosts(body, "test.hosts");
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].pattern, "ads.example");
        assert_eq!(records[0].ip, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert_eq!(records[0].comment.as_deref(), Some("telemetry"));
        assert_eq!(records[1].pattern, "tracker.example");
        assert_eq!(records[2].pattern, "router.lan");
        assert_eq!(records[2].ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(records[2].source.as_deref(), Some("test.hosts"));
    }

    #[test]
    fn regex_lines() {
        let body = "\
# block everything under doubleclick
(\\.|^)doubleclick\\.net$
(\\.|^)ads\\. # inline comment
";
        let records = parse_regex_list(body, "test.regex");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pattern, "(\\.|^)doubleclick\\.net$");
        assert_eq!(records[0].kind, RecordKind::Regex);
        assert_eq!(records[1].pattern, "(\\.|^)ads\\.");
    }

    #[test]
    fn json_records() {
        let single = r#"{"domain": "router.lan", "type": "direct", "ip": "10.0.0.1"}"#;
        let records = parse_json(single, "one.json").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source.as_deref(), Some("one.json"));

        let many = r#"[
            {"domain": "*doubleclick.net", "type": "wildcard"},
            {"domain": "ads.example", "type": "direct", "source": "hand-written"}
        ]"#;
        let records = parse_json(many, "many.json").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Wildcard);
        assert_eq!(records[1].source.as_deref(), Some("hand-written"));
    }

    #[test]
    fn cache_file_names() {
        assert_eq!(
            cached_name("https://hosts.example/lists/ads.hosts"),
            "https___hosts.example_lists_ads.hosts",
        );
    }
}
