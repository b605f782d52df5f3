//! Unpacks an OCI layer tar stream into a [`Formatter`] image (§4.2):
//! whiteout handling, deferred hardlink resolution, and progress reporting.

use std::collections::HashMap;
use std::io::Read;

use tar::{Archive, EntryType};

use crate::error::{Error, Result};
use crate::file_tree::Timestamps;
use crate::formatter::Formatter;
use crate::ondisk::constants::mode;

/// A single progress notification, mirroring the `{event, value}` shape
/// callers forward on to their own UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    AddItems(u64),
    AddSize(u64),
}

pub trait ProgressSink: Send {
    fn report(&mut self, event: ProgressEvent);
}

/// A no-op sink for callers that don't care about progress.
pub struct NullProgressSink;
impl ProgressSink for NullProgressSink {
    fn report(&mut self, _event: ProgressEvent) {}
}

pub struct ArchiveUnpacker;

impl ArchiveUnpacker {
    /// Streams every entry of `reader` into `formatter`. Hardlinks are
    /// deferred until the whole archive has been consumed, since a tar
    /// stream may link to a path that appears later.
    pub fn unpack<R: Read>(
        reader: R,
        formatter: &mut Formatter,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let mut archive = Archive::new(reader);
        // path -> link target path, both already normalized.
        let mut pending_hardlinks: HashMap<String, String> = HashMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let header = entry.header().clone();
            let raw_path = entry
                .path()?
                .to_str()
                .ok_or_else(|| Error::invalid_argument("tar entry path is not valid UTF-8"))?
                .to_string();
            let path = normalize_path(&raw_path);

            if let Some(parent) = whiteout_opaque_parent(&path) {
                formatter.unlink(&parent, true)?;
                progress.report(ProgressEvent::AddItems(1));
                continue;
            }
            if let Some(victim) = whiteout_victim(&path) {
                formatter.unlink(&victim, false)?;
                progress.report(ProgressEvent::AddItems(1));
                continue;
            }

            let entry_type = header.entry_type();
            let mode_bits = header.mode().unwrap_or(0o644) as u16;
            let uid = header.uid().ok().map(|u| u as u32);
            let gid = header.gid().ok().map(|g| g as u32);
            let mtime = header.mtime().unwrap_or(0);
            let timestamps = Timestamps {
                atime: (mtime as u32, 0),
                ctime: (mtime as u32, 0),
                mtime: (mtime as u32, 0),
            };

            match entry_type {
                EntryType::Directory => {
                    formatter.create(
                        &path,
                        None,
                        mode::IFDIR | (mode_bits & 0o7777),
                        Some(timestamps),
                        None,
                        uid,
                        gid,
                        None,
                    )?;
                    progress.report(ProgressEvent::AddItems(1));
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| Error::invalid_argument(format!("symlink {path} has no target")))?
                        .to_str()
                        .ok_or_else(|| Error::invalid_argument("symlink target is not valid UTF-8"))?
                        .to_string();
                    formatter.create(
                        &path,
                        Some(target.as_bytes()),
                        mode::IFLNK | (mode_bits & 0o7777),
                        Some(timestamps),
                        None,
                        uid,
                        gid,
                        None,
                    )?;
                    progress.report(ProgressEvent::AddItems(1));
                }
                EntryType::Link => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| Error::invalid_argument(format!("hardlink {path} has no target")))?
                        .to_str()
                        .ok_or_else(|| Error::invalid_argument("hardlink target is not valid UTF-8"))?
                        .to_string();
                    pending_hardlinks.insert(path, normalize_path(&target));
                    progress.report(ProgressEvent::AddItems(1));
                }
                EntryType::Regular | EntryType::Continuous => {
                    let size = header.size().unwrap_or(0);
                    formatter.create(
                        &path,
                        None,
                        mode::IFREG | (mode_bits & 0o7777),
                        Some(timestamps),
                        Some(&mut entry as &mut dyn Read),
                        uid,
                        gid,
                        None,
                    )?;
                    progress.report(ProgressEvent::AddItems(1));
                    progress.report(ProgressEvent::AddSize(size));
                }
                _ => {
                    // Unknown/unsupported entry types (fifos, devices, …)
                    // are skipped silently, per §4.2.
                }
            }
        }

        resolve_hardlinks(formatter, pending_hardlinks)?;
        Ok(())
    }
}

/// Resolves every deferred hardlink to its final non-hardlink target,
/// walking each chain and rejecting cycles with [`Error::CircularLinks`].
fn resolve_hardlinks(formatter: &mut Formatter, pending: HashMap<String, String>) -> Result<()> {
    for link_path in pending.keys() {
        let mut current = link_path.clone();
        let mut seen = vec![current.clone()];
        let final_target = loop {
            match pending.get(&current) {
                Some(next) if *next == *link_path || seen.contains(next) => {
                    return Err(Error::CircularLinks(link_path.clone()));
                }
                Some(next) => {
                    current = next.clone();
                    seen.push(current.clone());
                }
                None => break current,
            }
        };
        formatter.link(link_path, &final_target)?;
    }
    Ok(())
}

/// `./x` -> `/x`; anything else gets a leading slash if missing.
fn normalize_path(raw: &str) -> String {
    let stripped = raw.strip_prefix("./").unwrap_or(raw);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

/// `/dir/.wh..wh..opq` marks `/dir` as opaque: everything beneath it from
/// lower layers should be hidden.
fn whiteout_opaque_parent(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    if name != ".wh..wh..opq" {
        return None;
    }
    Some(parent_of(path))
}

/// `/dir/.wh.name` marks `/dir/name` as removed by this layer.
fn whiteout_victim(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let victim_name = name.strip_prefix(".wh.")?;
    if victim_name.is_empty() {
        return None;
    }
    let parent = parent_of(path);
    Some(if parent == "/" {
        format!("/{victim_name}")
    } else {
        format!("{parent}/{victim_name}")
    })
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_dot_slash_prefix() {
        assert_eq!(normalize_path("./a/b"), "/a/b");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/b"), "/a/b");
    }

    #[test]
    fn detects_opaque_whiteout() {
        assert_eq!(
            whiteout_opaque_parent("/dir/.wh..wh..opq"),
            Some("/dir".to_string())
        );
        assert_eq!(whiteout_opaque_parent("/dir/file"), None);
    }

    #[test]
    fn detects_entry_whiteout() {
        assert_eq!(
            whiteout_victim("/dir/.wh.secret"),
            Some("/dir/secret".to_string())
        );
        assert_eq!(whiteout_victim("/.wh.top"), Some("/top".to_string()));
        assert_eq!(whiteout_victim("/dir/plain"), None);
    }

    #[test]
    fn hardlink_chain_resolves_to_final_target() {
        let mut pending = HashMap::new();
        pending.insert("/b".to_string(), "/a".to_string());
        pending.insert("/c".to_string(), "/b".to_string());
        // Can't easily construct a real Formatter here without an image
        // file; chain-walking logic is exercised directly instead.
        let mut current = "/c".to_string();
        let mut seen = vec![current.clone()];
        let resolved = loop {
            match pending.get(&current) {
                Some(next) if seen.contains(next) => panic!("unexpected cycle"),
                Some(next) => {
                    current = next.clone();
                    seen.push(current.clone());
                }
                None => break current,
            }
        };
        assert_eq!(resolved, "/a");
    }
}
