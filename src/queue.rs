//! Queue files: a JSON array or a TOML document with `[[job]]` tables.
//!
//! ```toml
//! [[job]]
//! prompt = "a lighthouse at dusk"
//! segment_key = "scene-01"
//!
//! [[job]]
//! prompt = "the same lighthouse in a storm"
//! media_ref = "blob:ref-image"
//! special = true
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::state_machine::JobSpec;

#[derive(Debug, Deserialize)]
struct TomlQueue {
    #[serde(default, rename = "job")]
    jobs: Vec<JobSpec>,
}

/// Load a queue from `path`, choosing the format by extension. Entries with
/// a blank prompt are dropped.
pub fn load_queue(path: &Path) -> Result<Vec<JobSpec>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let specs = match ext.as_str() {
        "json" => parse_json(&contents),
        "toml" => parse_toml(&contents),
        other => bail!("unsupported queue format '{other}', expected .json or .toml"),
    }
    .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(clean(specs))
}

fn parse_json(contents: &str) -> Result<Vec<JobSpec>> {
    Ok(serde_json::from_str(contents)?)
}

fn parse_toml(contents: &str) -> Result<Vec<JobSpec>> {
    Ok(toml::from_str::<TomlQueue>(contents)?.jobs)
}

fn clean(specs: Vec<JobSpec>) -> Vec<JobSpec> {
    let total = specs.len();
    let kept: Vec<JobSpec> = specs
        .into_iter()
        .filter(|s| !s.prompt.trim().is_empty())
        .collect();
    if kept.len() < total {
        tracing::warn!(dropped = total - kept.len(), "Dropped queue entries with empty prompts");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_json_queue() {
        let file = write(
            ".json",
            r#"[{"prompt": "a fox"}, {"prompt": "a hen", "segment_key": "s2", "special": true}]"#,
        );
        let specs = load_queue(file.path()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].segment_key.as_deref(), Some("s2"));
        assert!(specs[1].special);
        assert!(!specs[0].special);
    }

    #[test]
    fn loads_toml_queue() {
        let file = write(
            ".toml",
            r#"
[[job]]
prompt = "first"

[[job]]
prompt = "second"
media_ref = "blob:ref"
"#,
        );
        let specs = load_queue(file.path()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].media_ref.as_deref(), Some("blob:ref"));
    }

    #[test]
    fn blank_prompts_are_dropped() {
        let file = write(".json", r#"[{"prompt": "  "}, {"prompt": "kept"}]"#);
        let specs = load_queue(file.path()).unwrap();
        assert_eq!(specs, vec![JobSpec::new("kept")]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = write(".yaml", "- prompt: x");
        let err = load_queue(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported queue format"));
    }

    #[test]
    fn malformed_json_names_the_file() {
        let file = write(".json", "{not json");
        let err = load_queue(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
