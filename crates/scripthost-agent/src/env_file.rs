use std::path::Path;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

/// Parse `KEY=VALUE` override lines. Blank lines, `#` comments and lines
/// without `=` are skipped; surrounding quotes are stripped from values.
pub fn parse(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        let value = v.trim().trim_matches('"').trim_matches('\'');
        out.push((key.to_string(), value.to_string()));
    }
    out
}

/// Load overrides from `path`; a missing file means no overrides.
pub async fn load(path: &Path) -> Vec<(String, String)> {
    match tokio::fs::read(path).await {
        Ok(raw) => parse(&String::from_utf8_lossy(&raw)),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "env override file unreadable");
            }
            Vec::new()
        }
    }
}

/// Append raw `KEY=VALUE` text to an override file, starting on a new line.
pub async fn append(path: &Path, text: &str) -> anyhow::Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let needs_newline = tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);

    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    if needs_newline {
        f.write_all(b"\n").await?;
    }
    f.write_all(text.as_bytes()).await?;
    f.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_strips_quotes() {
        let src = r#"
# comment
TOKEN="abc=def"
 NAME = 'bot'
EMPTY=
not a pair
=orphan
PLAIN=value
"#;
        let got = parse(src);
        assert_eq!(
            got,
            vec![
                ("TOKEN".to_string(), "abc=def".to_string()),
                ("NAME".to_string(), "bot".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("PLAIN".to_string(), "value".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_file_has_no_overrides() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join(".env")).await.is_empty());
    }

    #[tokio::test]
    async fn append_separates_chunks_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w").join(".env");
        append(&path, "A=1").await.unwrap();
        append(&path, "B=2\nC=3\n").await.unwrap();
        append(&path, "   ").await.unwrap();
        let got = load(&path).await;
        assert_eq!(got.len(), 3);
        assert_eq!(got[1], ("B".to_string(), "2".to_string()));
    }

    #[tokio::test]
    async fn invalid_utf8_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        tokio::fs::write(&path, b"A=\xff\xfe\nB=ok\n").await.unwrap();
        let got = load(&path).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].1, "ok");
    }
}
