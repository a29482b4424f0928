//! Per-attempt sandbox workspace
//!
//! Every attempt gets a fresh temp directory with four subtrees that the
//! sandbox mounts:
//!
//! | host dir     | container path | mode |
//! |--------------|----------------|------|
//! | `challenge/` | `/challenge`   | ro   |
//! | `scratch/`   | `/scratch`     | rw   |
//! | `shared/`    | `/shared`      | ro   |
//! | `output/`    | `/output`      | rw   |
//!
//! `shared/` is a snapshot of the rejected answers taken at round start, so
//! nothing an agent or a concurrent writer does mid-round changes it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::state::ChallengeLayout;

pub const ANSWER_FILE: &str = "answer.txt";

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Build a workspace for one attempt from the challenge's artifact tree
    pub fn prepare(layout: &ChallengeLayout, agent: &str) -> io::Result<Self> {
        let prefix = format!("ctf-swarm-{}-", agent.replace('#', "-"));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        let ws = Self { dir };

        for sub in [
            ws.challenge_dir(),
            ws.scratch_dir(),
            ws.shared_dir(),
            ws.output_dir(),
        ] {
            fs::create_dir_all(&sub)?;
        }

        for file in [layout.problem_file(), layout.prompt_file(), layout.hints_file()] {
            if let Some(name) = file.file_name() {
                if file.is_file() {
                    fs::copy(&file, ws.challenge_dir().join(name))?;
                }
            }
        }
        copy_tree(&layout.files_dir(), &ws.challenge_dir().join("files"))?;
        copy_tree(&layout.shared_dir(), &ws.shared_dir())?;

        // Agents may run as an unprivileged user inside the container
        make_world_writable(&ws.scratch_dir())?;
        make_world_writable(&ws.output_dir())?;

        debug!("Prepared workspace {} for {}", ws.path().display(), agent);
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.path().join("challenge")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.path().join("scratch")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.path().join("shared")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path().join("output")
    }

    pub fn answer_path(&self) -> PathBuf {
        self.output_dir().join(ANSWER_FILE)
    }

    pub fn read_answer(&self) -> Option<String> {
        read_answer_in(self.path())
    }
}

/// The agent's answer: first non-empty line of `<workspace>/output/answer.txt`.
/// A missing or non UTF-8 file is no answer.
pub fn read_answer_in(workspace: &Path) -> Option<String> {
    let raw = fs::read(workspace.join("output").join(ANSWER_FILE)).ok()?;
    String::from_utf8(raw)
        .ok()?
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Recursively copy `src` into `dst`; a missing `src` copies nothing
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_world_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
fn make_world_writable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeId;

    fn layout() -> (TempDir, ChallengeLayout) {
        let root = TempDir::new().unwrap();
        let layout = ChallengeLayout::new(root.path(), ChallengeId(9));
        layout.ensure().unwrap();
        fs::write(layout.problem_file(), "decrypt this").unwrap();
        fs::write(layout.prompt_file(), "# Challenge").unwrap();
        fs::create_dir_all(layout.files_dir().join("nested")).unwrap();
        fs::write(layout.files_dir().join("nested/chall.bin"), [1u8, 2, 3]).unwrap();
        fs::write(
            layout.shared_dir().join(crate::state::REJECTED_ANSWERS_FILE),
            "flag{nope}\n",
        )
        .unwrap();
        (root, layout)
    }

    #[test]
    fn test_prepare_copies_inputs() {
        let (_root, layout) = layout();
        let ws = Workspace::prepare(&layout, "claude#2").unwrap();

        assert_eq!(
            fs::read_to_string(ws.challenge_dir().join("problem.txt")).unwrap(),
            "decrypt this"
        );
        assert_eq!(
            fs::read(ws.challenge_dir().join("files/nested/chall.bin")).unwrap(),
            vec![1, 2, 3]
        );
        assert!(ws.shared_dir().join("rejected_answers.txt").exists());
        assert!(ws.scratch_dir().is_dir());
        assert!(!ws.challenge_dir().join("hints.txt").exists());
    }

    #[test]
    fn test_shared_is_a_snapshot() {
        let (_root, layout) = layout();
        let ws = Workspace::prepare(&layout, "codex").unwrap();
        fs::write(
            layout.shared_dir().join(crate::state::REJECTED_ANSWERS_FILE),
            "flag{nope}\nflag{later}\n",
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(ws.shared_dir().join("rejected_answers.txt")).unwrap(),
            "flag{nope}\n"
        );
    }

    #[test]
    fn test_read_answer() {
        let (_root, layout) = layout();
        let ws = Workspace::prepare(&layout, "codex").unwrap();
        assert_eq!(ws.read_answer(), None);

        fs::write(ws.answer_path(), "   \n").unwrap();
        assert_eq!(ws.read_answer(), None);

        fs::write(ws.answer_path(), "\n  flag{found}  \nnotes\n").unwrap();
        assert_eq!(ws.read_answer(), Some("flag{found}".to_string()));
    }

    #[test]
    fn test_binary_answer_is_no_answer() {
        let (_root, layout) = layout();
        let ws = Workspace::prepare(&layout, "codex").unwrap();
        fs::write(ws.answer_path(), [0xff, 0xfe, b'x']).unwrap();
        assert_eq!(ws.read_answer(), None);
        assert_eq!(read_answer_in(ws.path()), None);
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let (_root, layout) = layout();
        let ws = Workspace::prepare(&layout, "codex").unwrap();
        let path = ws.path().to_path_buf();
        drop(ws);
        assert!(!path.exists());
    }
}
