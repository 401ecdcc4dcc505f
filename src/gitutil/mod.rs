// Git working-tree utilities — snapshot the current working tree (staged,
// unstaged and untracked files included) without touching the real index.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// Ref under which `capture_working_tree_commit` publishes its snapshot so
/// the commit stays reachable while CI runs against it.
pub const CI_WORKING_TREE_REF: &str = "refs/heads/__ci_working_tree__";

/// A snapshot commit of the working tree, plus whether a temporary ref was
/// created to keep it alive.
#[derive(Debug, Clone)]
pub struct WorkingTreeCommit {
    pub commit: String,
    pub needs_ref_cleanup: bool,
}

fn run_git(repo: &Path, args: &[&str], envs: &[(&str, &str)]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let output = cmd
        .output()
        .context("failed to invoke `git` — is it installed and on PATH?")?;
    if !output.status.success() {
        bail!(
            "git {} failed with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Locate the root of the repository enclosing `start`.
pub fn repo_root(start: &Path) -> Result<PathBuf> {
    let top = run_git(start, &["rev-parse", "--show-toplevel"], &[])?;
    Ok(PathBuf::from(top))
}

/// Write the current working tree as a git tree object and return its id.
///
/// A clean tree is just `git write-tree`. A dirty one is staged into a
/// throwaway copy of the index (pointed at via `GIT_INDEX_FILE`), so the
/// user's real staging area is never modified. With `ephemeral` the new
/// blob/tree objects land in a temporary object directory that is deleted
/// on return; the returned id is then only resolvable through an alternates
/// setup and is mainly useful for comparison.
pub fn write_working_tree(repo_root: &Path, ephemeral: bool) -> Result<String> {
    let status = run_git(
        repo_root,
        &["status", "--porcelain", "--ignore-submodules=dirty"],
        &[],
    )?;
    if status.is_empty() {
        return run_git(repo_root, &["write-tree"], &[]);
    }

    let scratch = tempfile::tempdir().context("failed to create scratch directory")?;
    let tmp_index = scratch.path().join("index");

    // Seed the scratch index from the real one so already-staged entries
    // carry over; a missing index (fresh repo) just starts empty.
    let real_index = run_git(repo_root, &["rev-parse", "--git-path", "index"], &[])?;
    let real_index = repo_root.join(real_index);
    if real_index.is_file() {
        std::fs::copy(&real_index, &tmp_index)
            .with_context(|| format!("failed to copy index from {}", real_index.display()))?;
    }

    let tmp_index_str = tmp_index.to_string_lossy().into_owned();
    let ephemeral_dirs = if ephemeral {
        let object_dir = scratch.path().join("objects").to_string_lossy().into_owned();
        let git_dir = run_git(repo_root, &["rev-parse", "--git-dir"], &[])?;
        let alternates = repo_root
            .join(git_dir)
            .join("objects")
            .to_string_lossy()
            .into_owned();
        Some((object_dir, alternates))
    } else {
        None
    };

    let mut envs: Vec<(&str, &str)> = vec![("GIT_INDEX_FILE", &tmp_index_str)];
    if let Some((object_dir, alternates)) = &ephemeral_dirs {
        envs.push(("GIT_OBJECT_DIRECTORY", object_dir));
        envs.push(("GIT_ALTERNATE_OBJECT_DIRECTORIES", alternates));
    }

    run_git(repo_root, &["add", "-A"], &envs)?;
    let tree = run_git(repo_root, &["write-tree"], &envs)?;
    debug!(%tree, ephemeral, "wrote working tree");
    Ok(tree)
}

/// Commit the current working tree so a CI container can fetch it.
///
/// When the tree matches `HEAD` no commit is made and `HEAD` itself is
/// returned. Otherwise a throwaway commit with `HEAD` as parent is created
/// and pinned under [`CI_WORKING_TREE_REF`] to keep it fetchable.
pub fn capture_working_tree_commit(repo_root: &Path) -> Result<WorkingTreeCommit> {
    let tree = write_working_tree(repo_root, false)?;
    let head_tree = run_git(repo_root, &["rev-parse", "HEAD^{tree}"], &[])?;
    if tree == head_tree {
        let head = run_git(repo_root, &["rev-parse", "HEAD"], &[])?;
        return Ok(WorkingTreeCommit {
            commit: head,
            needs_ref_cleanup: false,
        });
    }

    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let message = format!("ci: working-tree snapshot at {unix_ms}");
    let commit = run_git(
        repo_root,
        &["commit-tree", &tree, "-p", "HEAD", "-m", &message],
        &[],
    )?;
    run_git(
        repo_root,
        &["update-ref", CI_WORKING_TREE_REF, &commit],
        &[],
    )?;
    debug!(%commit, "captured working tree commit");
    Ok(WorkingTreeCommit {
        commit,
        needs_ref_cleanup: true,
    })
}

/// Remove the snapshot ref; failures are logged and swallowed since the ref
/// being gone is the desired end state.
pub fn cleanup_working_tree_ref(repo_root: &Path) {
    if let Err(err) = run_git(repo_root, &["update-ref", "-d", CI_WORKING_TREE_REF], &[]) {
        warn!("failed to remove {CI_WORKING_TREE_REF}: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"], &[]).unwrap();
        run_git(dir.path(), &["config", "user.email", "test@test"], &[]).unwrap();
        run_git(dir.path(), &["config", "user.name", "test"], &[]).unwrap();
        dir
    }

    fn commit_file(repo: &Path, name: &str, contents: &str) {
        std::fs::write(repo.join(name), contents).unwrap();
        run_git(repo, &["add", name], &[]).unwrap();
        run_git(repo, &["commit", "-q", "-m", "add file"], &[]).unwrap();
    }

    #[test]
    fn clean_tree_matches_head() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        let tree = write_working_tree(repo.path(), false).unwrap();
        let head_tree = run_git(repo.path(), &["rev-parse", "HEAD^{tree}"], &[]).unwrap();
        assert_eq!(tree, head_tree);
    }

    #[test]
    fn dirty_tree_differs_and_leaves_index_alone() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        std::fs::write(repo.path().join("untracked.txt"), "new\n").unwrap();

        let tree = write_working_tree(repo.path(), false).unwrap();
        let head_tree = run_git(repo.path(), &["rev-parse", "HEAD^{tree}"], &[]).unwrap();
        assert_ne!(tree, head_tree);

        // The real staging area must still show the file as untracked.
        let status = run_git(repo.path(), &["status", "--porcelain"], &[]).unwrap();
        assert!(status.contains("?? untracked.txt"));
    }

    #[test]
    fn ephemeral_tree_objects_do_not_persist() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        std::fs::write(repo.path().join("b.txt"), "dirty\n").unwrap();

        let tree = write_working_tree(repo.path(), true).unwrap();
        // The tree object lived in a temp object dir that is now gone.
        assert!(run_git(repo.path(), &["cat-file", "-e", &tree], &[]).is_err());
    }

    #[test]
    fn capture_on_clean_tree_returns_head() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        let snapshot = capture_working_tree_commit(repo.path()).unwrap();
        let head = run_git(repo.path(), &["rev-parse", "HEAD"], &[]).unwrap();
        assert_eq!(snapshot.commit, head);
        assert!(!snapshot.needs_ref_cleanup);
    }

    #[test]
    fn capture_on_dirty_tree_pins_a_ref() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        std::fs::write(repo.path().join("a.txt"), "changed\n").unwrap();

        let snapshot = capture_working_tree_commit(repo.path()).unwrap();
        assert!(snapshot.needs_ref_cleanup);
        let pinned = run_git(repo.path(), &["rev-parse", CI_WORKING_TREE_REF], &[]).unwrap();
        assert_eq!(pinned, snapshot.commit);

        cleanup_working_tree_ref(repo.path());
        assert!(run_git(repo.path(), &["rev-parse", "--verify", CI_WORKING_TREE_REF], &[]).is_err());
    }

    #[test]
    fn repo_root_resolves_from_subdirectory() {
        let repo = init_repo();
        commit_file(repo.path(), "a.txt", "hello\n");
        let nested = repo.path().join("sub");
        std::fs::create_dir(&nested).unwrap();
        let root = repo_root(&nested).unwrap();
        assert_eq!(root.canonicalize().unwrap(), repo.path().canonicalize().unwrap());
    }
}
