use std::path::Path;

use git2::{Commit, Diff, DiffFormat, ErrorCode, ObjectType, Oid, Repository, Signature};

use crate::error::{MeshError, Result};

/// Information about the current HEAD: branch name and commit SHA.
pub struct HeadInfo {
    pub branch: Option<String>,
    pub sha: String,
}

/// Retrieve the current HEAD's branch name and commit SHA.
/// Returns None if the repo root is not inside a git repository.
pub fn current_head_info(repo_root: &Path) -> Option<HeadInfo> {
    let repo = Repository::discover(repo_root).ok()?;
    let head = repo.head().ok()?;
    let branch = if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    };
    let sha = head.peel_to_commit().ok()?.id().to_string();
    Some(HeadInfo { branch, sha })
}

/// A diff reduced to what the witness binds: exact patch bytes, git's
/// stable patch id, and the sorted list of touched paths.
#[derive(Debug, Clone)]
pub struct DiffSnapshot {
    pub patch: Vec<u8>,
    pub patch_id: String,
    pub files: Vec<String>,
}

fn snapshot(diff: &Diff<'_>) -> Result<DiffSnapshot> {
    let mut patch = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            patch.push(line.origin() as u8);
        }
        patch.extend_from_slice(line.content());
        true
    })?;

    let patch_id = diff.patchid(None)?.to_string();

    let mut files = diff
        .deltas()
        .filter_map(|delta| {
            delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|path| path.to_string_lossy().replace('\\', "/"))
        })
        .collect::<Vec<_>>();
    files.sort();
    files.dedup();

    Ok(DiffSnapshot {
        patch,
        patch_id,
        files,
    })
}

/// The staged changes (HEAD tree vs index). `NothingStaged` when empty.
pub fn staged_diff(repo_root: &Path) -> Result<DiffSnapshot> {
    let repo = Repository::discover(repo_root)?;
    let index = repo.index()?;
    let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());
    let diff = repo.diff_tree_to_index(head_tree.as_ref(), Some(&index), None)?;
    if diff.deltas().len() == 0 {
        return Err(MeshError::NothingStaged);
    }
    snapshot(&diff)
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now("agentmesh", "agentmesh@localhost")?),
    }
}

/// Write the index as a commit on HEAD. Returns the new commit SHA.
pub fn commit_index(repo_root: &Path, message: &str) -> Result<String> {
    let repo = Repository::discover(repo_root)?;
    let mut index = repo.index()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = signature(&repo)?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

/// A commit's own diff (first parent vs commit), message and full SHA.
pub struct CommitView {
    pub sha: String,
    pub message: String,
    pub diff: DiffSnapshot,
}

pub fn commit_view(repo_root: &Path, rev: &str) -> Result<CommitView> {
    let repo = Repository::discover(repo_root)?;
    let commit = repo.revparse_single(rev)?.peel_to_commit()?;
    let tree = commit.tree()?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    Ok(CommitView {
        sha: commit.id().to_string(),
        message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        diff: snapshot(&diff)?,
    })
}

fn blob_text(repo: &Repository, oid: Oid) -> Result<String> {
    let blob = repo.find_blob(oid)?;
    Ok(String::from_utf8_lossy(blob.content()).into_owned())
}

/// Contents of `rel_path` in the HEAD commit. `None` when there is no HEAD
/// yet or the path is not a file there.
pub fn file_at_head(repo_root: &Path, rel_path: &str) -> Result<Option<String>> {
    let repo = Repository::discover(repo_root)?;
    let Some(tree) = repo.head().ok().and_then(|h| h.peel_to_tree().ok()) else {
        return Ok(None);
    };
    let entry = match tree.get_path(Path::new(rel_path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.kind() != Some(ObjectType::Blob) {
        return Ok(None);
    }
    blob_text(&repo, entry.id()).map(Some)
}

/// Contents of `rel_path` as staged in the index.
pub fn file_in_index(repo_root: &Path, rel_path: &str) -> Result<Option<String>> {
    let repo = Repository::discover(repo_root)?;
    let index = repo.index()?;
    match index.get_path(Path::new(rel_path), 0) {
        Some(entry) => blob_text(&repo, entry.id).map(Some),
        None => Ok(None),
    }
}

/// The working directory of the repository containing `repo_root`.
pub fn workdir(repo_root: &Path) -> Option<std::path::PathBuf> {
    let repo = Repository::discover(repo_root).ok()?;
    repo.workdir().map(Path::to_path_buf)
}

/// `path` relative to the working directory, `/`-separated. `None` when
/// outside the repository.
pub fn workdir_relative(repo_root: &Path, path: &Path) -> Option<String> {
    let workdir = workdir(repo_root)?;
    let rel = match path.strip_prefix(&workdir) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => {
            let canonical = workdir.canonicalize().ok()?;
            let parent = path.parent()?.canonicalize().ok()?;
            parent.strip_prefix(&canonical).ok()?.join(path.file_name()?)
        }
    };
    Some(rel.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn stage(repo: &Repository, dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
    }

    #[test]
    fn staged_diff_matches_committed_diff() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(matches!(staged_diff(dir.path()), Err(MeshError::NothingStaged)));

        stage(&repo, dir.path(), "a.txt", "one\n");
        commit_index(dir.path(), "first").unwrap();

        stage(&repo, dir.path(), "a.txt", "one\ntwo\n");
        stage(&repo, dir.path(), "b.txt", "new\n");
        let staged = staged_diff(dir.path()).unwrap();
        assert_eq!(staged.files, vec!["a.txt", "b.txt"]);
        assert!(String::from_utf8_lossy(&staged.patch).contains("+two"));

        let sha = commit_index(dir.path(), "second\n\nbody").unwrap();
        let view = commit_view(dir.path(), "HEAD").unwrap();
        assert_eq!(view.sha, sha);
        assert_eq!(view.diff.patch, staged.patch);
        assert_eq!(view.diff.patch_id, staged.patch_id);
        assert!(view.message.starts_with("second"));

        let head = current_head_info(dir.path()).unwrap();
        assert_eq!(head.sha, sha);
    }

    #[test]
    fn file_contents_at_head_and_in_index() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert_eq!(file_at_head(dir.path(), "a.py").unwrap(), None);

        stage(&repo, dir.path(), "a.py", "def one(): pass\n");
        commit_index(dir.path(), "first").unwrap();
        stage(&repo, dir.path(), "a.py", "def two(): pass\n");

        assert_eq!(
            file_at_head(dir.path(), "a.py").unwrap().as_deref(),
            Some("def one(): pass\n")
        );
        assert_eq!(
            file_in_index(dir.path(), "a.py").unwrap().as_deref(),
            Some("def two(): pass\n")
        );
        assert_eq!(file_at_head(dir.path(), "missing.py").unwrap(), None);
        assert_eq!(file_in_index(dir.path(), "missing.py").unwrap(), None);

        let abs = dir.path().join("a.py");
        assert_eq!(workdir_relative(dir.path(), &abs).as_deref(), Some("a.py"));
        assert_eq!(workdir_relative(dir.path(), Path::new("/elsewhere/a.py")), None);
    }

    #[test]
    fn root_commit_diffs_against_empty_tree() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        stage(&repo, dir.path(), "only.txt", "x\n");
        commit_index(dir.path(), "root").unwrap();
        let view = commit_view(dir.path(), "HEAD").unwrap();
        assert_eq!(view.diff.files, vec!["only.txt"]);
    }
}
