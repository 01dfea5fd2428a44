use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use walkdir::WalkDir;

use crate::media::tool_command;

/// Extensions picked up when a directory is given as input.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

pub fn ensure_ffmpeg_available(ffmpeg: &Path) -> Result<()> {
    let out = tool_command(ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed to run {} -version", ffmpeg.display()))?;
    if !out.success() {
        bail!("{} exists but returned non-zero on -version", ffmpeg.display());
    }
    Ok(())
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Expands directories into their video files; explicit files are kept as given.
///
/// Directory contents are sorted by path. Without `recursive` only the
/// directory's own entries are considered.
pub fn discover_inputs(paths: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_file() {
            out.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("input does not exist: {}", path.display());
        }

        let mut walker = WalkDir::new(path).min_depth(1).sort_by_file_name();
        if !recursive {
            walker = walker.max_depth(1);
        }
        let mut found = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("failed to scan {}", path.display()))?;
            if entry.file_type().is_file() && is_video_file(entry.path()) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        out.extend(found);
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|p| seen.insert(p.clone()));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(is_video_file(Path::new("a.MP4")));
        assert!(is_video_file(Path::new("dir/b.mov")));
        assert!(is_video_file(Path::new("c.Avi")));
        assert!(!is_video_file(Path::new("d.mkv")));
        assert!(!is_video_file(Path::new("mp4")));
    }

    #[test]
    fn directories_expand_to_sorted_videos() {
        let dir = TempDir::new().expect("tempdir");
        for name in ["b.mp4", "a.MOV", "notes.txt", "c.avi"] {
            fs::write(dir.path().join(name), b"x").expect("write");
        }
        fs::create_dir(dir.path().join("nested")).expect("mkdir");
        fs::write(dir.path().join("nested").join("d.mp4"), b"x").expect("write");

        let flat = discover_inputs(&[dir.path().to_path_buf()], false).expect("discover");
        let names: Vec<_> = flat
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MOV", "b.mp4", "c.avi"]);

        let deep = discover_inputs(&[dir.path().to_path_buf()], true).expect("discover");
        assert_eq!(deep.len(), 4);
        assert!(deep.iter().any(|p| p.ends_with("nested/d.mp4")));
    }

    #[test]
    fn explicit_files_are_kept_and_deduplicated() {
        let dir = TempDir::new().expect("tempdir");
        let clip = dir.path().join("clip.mkv");
        fs::write(&clip, b"x").expect("write");
        let found = discover_inputs(&[clip.clone(), clip.clone()], false).expect("discover");
        assert_eq!(found, vec![clip]);

        let missing = discover_inputs(&[dir.path().join("gone.mp4")], false);
        assert!(missing.is_err());
    }
}
