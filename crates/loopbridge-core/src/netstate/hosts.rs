//! Session-tagged hosts-file editing.
//!
//! Entries added on behalf of a session live inside a marker block:
//!
//! ```text
//! # loopbridge:session-3 begin
//! # namespace ns1
//! 127.1.1.1 svc-a svc-a.ns1
//! # loopbridge:session-3 end
//! ```
//!
//! Lines outside a session's block are never modified or removed, and
//! removing the block restores the file to its pre-session form. The whole
//! edit is a read-modify-write of the full file.

use std::path::{Path, PathBuf};

use crate::ipc::types::HostsEntrySpec;

const MARKER_PREFIX: &str = "# loopbridge:";

/// Errors from hosts-file editing.
#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("failed to access hosts file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Editor for one hosts file.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entries` to the block tagged `tag`, creating the block if
    /// needed. Entries whose ip+hostnames already appear in the file are
    /// not duplicated.
    pub async fn add_entries(
        &self,
        tag: &str,
        namespace: &str,
        entries: &[HostsEntrySpec],
    ) -> Result<(), HostsError> {
        let contents = self.read().await?;
        let updated = upsert_block(&contents, tag, namespace, entries);
        if updated != contents {
            self.write(&updated).await?;
        }
        Ok(())
    }

    /// Remove the block tagged `tag`. Removing an absent block is a no-op.
    pub async fn remove_entries(&self, tag: &str) -> Result<(), HostsError> {
        let contents = self.read().await?;
        let updated = strip_block(&contents, tag);
        if updated != contents {
            self.write(&updated).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<String, HostsError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| HostsError::Io {
                path: self.path.clone(),
                source,
            })
    }

    async fn write(&self, contents: &str) -> Result<(), HostsError> {
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|source| HostsError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

fn begin_marker(tag: &str) -> String {
    format!("{MARKER_PREFIX}{tag} begin")
}

fn end_marker(tag: &str) -> String {
    format!("{MARKER_PREFIX}{tag} end")
}

/// One hosts line in canonical whitespace form, or `None` for comments and
/// blanks.
fn canonical_entry(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn render_entry(entry: &HostsEntrySpec) -> String {
    format!("{} {}", entry.ip, entry.hostnames.join(" "))
}

/// Rebuild `contents` with the `tag` block holding its previous entries
/// plus any of `entries` not already present somewhere in the file.
pub fn upsert_block(
    contents: &str,
    tag: &str,
    namespace: &str,
    entries: &[HostsEntrySpec],
) -> String {
    let begin = begin_marker(tag);
    let end = end_marker(tag);

    let mut outside = Vec::new();
    let mut block_entries: Vec<String> = Vec::new();
    let mut in_block = false;
    for line in contents.lines() {
        if line.trim() == begin {
            in_block = true;
            continue;
        }
        if line.trim() == end {
            in_block = false;
            continue;
        }
        if in_block {
            if let Some(canon) = canonical_entry(line) {
                block_entries.push(canon);
            }
        } else {
            outside.push(line.to_string());
        }
    }

    // Everything already resolvable, block-owned or not, suppresses a
    // duplicate addition.
    let mut present: Vec<String> = outside.iter().filter_map(|l| canonical_entry(l)).collect();
    present.extend(block_entries.iter().cloned());

    for entry in entries {
        let canon = canonical_entry(&render_entry(entry)).unwrap_or_default();
        if canon.is_empty() || present.contains(&canon) {
            continue;
        }
        present.push(canon.clone());
        block_entries.push(canon);
    }

    let mut out = outside;
    if !block_entries.is_empty() {
        out.push(begin);
        out.push(format!("# namespace {namespace}"));
        out.extend(block_entries);
        out.push(end);
    }

    finish(out)
}

/// Rebuild `contents` without the `tag` block.
pub fn strip_block(contents: &str, tag: &str) -> String {
    let begin = begin_marker(tag);
    let end = end_marker(tag);

    let mut out = Vec::new();
    let mut in_block = false;
    for line in contents.lines() {
        if line.trim() == begin {
            in_block = true;
            continue;
        }
        if line.trim() == end {
            in_block = false;
            continue;
        }
        if !in_block {
            out.push(line.to_string());
        }
    }
    finish(out)
}

fn finish(lines: Vec<String>) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut s = lines.join("\n");
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

    fn entry(ip: [u8; 4], names: &[&str]) -> HostsEntrySpec {
        HostsEntrySpec {
            ip: Ipv4Addr::from(ip),
            hostnames: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_upsert_creates_block() {
        let updated = upsert_block(
            BASE,
            "session-1",
            "ns1",
            &[entry([127, 1, 1, 1], &["svc-a", "svc-a.ns1"])],
        );
        assert!(updated.starts_with(BASE));
        assert!(updated.contains("# loopbridge:session-1 begin"));
        assert!(updated.contains("127.1.1.1 svc-a svc-a.ns1"));
        assert!(updated.contains("# loopbridge:session-1 end"));
    }

    #[test]
    fn test_strip_restores_original() {
        let updated = upsert_block(
            BASE,
            "session-1",
            "ns1",
            &[entry([127, 1, 1, 1], &["svc-a"])],
        );
        assert_eq!(strip_block(&updated, "session-1"), BASE);
    }

    #[test]
    fn test_strip_without_block_is_noop() {
        assert_eq!(strip_block(BASE, "session-9"), BASE);
    }

    #[test]
    fn test_identical_entry_not_duplicated() {
        let once = upsert_block(BASE, "session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])]);
        let twice = upsert_block(&once, "session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_entry_existing_outside_block_not_duplicated() {
        let contents = "127.0.0.1 localhost\n127.1.1.1 svc-a\n";
        let updated = upsert_block(contents, "session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])]);
        // Nothing new to add, so no block is created either.
        assert_eq!(updated, contents);
    }

    #[test]
    fn test_second_add_extends_block() {
        let first = upsert_block(BASE, "session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])]);
        let second = upsert_block(
            &first,
            "session-1",
            "ns1",
            &[entry([127, 1, 1, 2], &["svc-b"])],
        );
        assert!(second.contains("127.1.1.1 svc-a"));
        assert!(second.contains("127.1.1.2 svc-b"));
        // Still exactly one block.
        assert_eq!(second.matches("session-1 begin").count(), 1);
        assert_eq!(strip_block(&second, "session-1"), BASE);
    }

    #[test]
    fn test_foreign_block_untouched() {
        let first = upsert_block(BASE, "session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])]);
        let second = upsert_block(
            &first,
            "session-2",
            "ns2",
            &[entry([127, 1, 1, 2], &["svc-b"])],
        );
        let cleaned = strip_block(&second, "session-2");
        assert_eq!(cleaned, first);
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hosts");
        tokio::fs::write(&path, BASE).await.unwrap();

        let hosts = HostsFile::new(&path);
        hosts
            .add_entries("session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])])
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("127.1.1.1 svc-a"));

        hosts.remove_entries("session-1").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, BASE);

        // Removing again is a no-op, not an error.
        hosts.remove_entries("session-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let hosts = HostsFile::new("/nonexistent/path/hosts");
        let err = hosts
            .add_entries("session-1", "ns1", &[entry([127, 1, 1, 1], &["svc-a"])])
            .await
            .unwrap_err();
        assert!(matches!(err, HostsError::Io { .. }));
    }
}
