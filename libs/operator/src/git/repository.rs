//! Synchronous libgit2 plumbing for one branch checkout. Everything here is
//! blocking and runs under `spawn_blocking` from the worker; the worker's
//! mutex is the only writer lock a checkout ever needs.

use crate::error::{Error, Result};
use crate::git::credentials::GitCredentials;
use crate::identity::ResourceIdentifier;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{ErrorCode, FetchOptions, IndexAddOption, PushOptions, Repository, ResetType, Signature};
use sha2::{Digest, Sha256};

/// Committer identity; authorship carries the correlated user, trailers
/// carry the controller identity.
const COMMITTER_NAME: &str = "configbutler";
const COMMITTER_EMAIL: &str = "bot@configbutler";

/// `<workDir>/<ns>/<provider>/<branch>/repos/<hex(sha256(remoteURL))>`.
/// Hashing the URL means a changed remote gets a disjoint checkout and can
/// never leak stale objects from the previous one.
pub fn checkout_dir(
    work_dir: &Path,
    namespace: &str,
    provider: &str,
    branch: &str,
    remote_url: &str,
) -> PathBuf {
    let hash = hex::encode(Sha256::digest(remote_url.as_bytes()));
    work_dir
        .join(namespace)
        .join(provider)
        .join(path_component(branch))
        .join("repos")
        .join(hash)
}

/// Filesystem-safe path segment derived from the remote host, e.g.
/// `github.com` for both `https://github.com/...` and `git@github.com:...`.
pub fn provider_segment(remote_url: &str) -> String {
    let rest = remote_url
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(remote_url);
    let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
    let host = rest
        .split(['/', ':'])
        .next()
        .filter(|h| !h.is_empty())
        .unwrap_or("local");
    path_component(host)
}

fn path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Clone, Debug)]
pub enum MutationOp {
    Write(Vec<u8>),
    Delete,
}

/// One filesystem change, path relative to the checkout root.
#[derive(Clone, Debug)]
pub struct FileMutation {
    pub path: PathBuf,
    pub op: MutationOp,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AppliedChanges {
    pub written: usize,
    pub deleted: usize,
    pub bytes: usize,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.written == 0 && self.deleted == 0
    }
}

#[derive(Debug)]
pub enum PushOutcome {
    Pushed,
    /// Remote rejected the update (non-fast-forward or similar); caller
    /// fetches, resets and replays.
    Rejected(String),
}

pub struct Checkout {
    repo: Repository,
    path: PathBuf,
    branch: String,
}

impl Checkout {
    /// Open the checkout, creating or re-creating it as needed. An existing
    /// directory that does not open cleanly onto the expected branch is
    /// wiped and prepared from scratch; partial repairs of remote-tracking
    /// state are not attempted.
    pub fn prepare(path: &Path, url: &str, branch: &str, creds: &GitCredentials) -> Result<Checkout> {
        match Self::open_existing(path, branch) {
            Ok(checkout) => Ok(checkout),
            Err(_) => {
                if path.exists() {
                    fs::remove_dir_all(path).map_err(Error::IoError)?;
                }
                Self::create(path, url, branch, creds)
            }
        }
    }

    fn open_existing(path: &Path, branch: &str) -> Result<Checkout> {
        if !path.join(".git").exists() {
            return Err(Error::GitError(git2::Error::from_str("no checkout")));
        }
        let repo = Repository::open(path)?;
        let expected = format!("refs/heads/{branch}");
        let head = repo.find_reference("HEAD")?;
        let consistent = match head.symbolic_target() {
            Some(target) if target == expected => {
                // born HEADs must also resolve
                head.resolve().is_ok() || repo.find_reference(&expected).is_err()
            }
            _ => false,
        };
        drop(head);
        if !consistent {
            return Err(Error::GitError(git2::Error::from_str(
                "checkout HEAD inconsistent with expected branch",
            )));
        }
        Ok(Checkout {
            repo,
            path: path.to_path_buf(),
            branch: branch.to_string(),
        })
    }

    fn create(path: &Path, url: &str, branch: &str, creds: &GitCredentials) -> Result<Checkout> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::IoError)?;
        }

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(creds.callbacks());
        let cloned = RepoBuilder::new()
            .branch(branch)
            .fetch_options(fetch_options)
            .clone(url, path);

        let repo = match cloned {
            Ok(repo) => repo,
            Err(_) => {
                // Empty remote, or the branch is not born yet: start from an
                // unborn HEAD pointing at the target branch.
                if path.exists() {
                    fs::remove_dir_all(path).map_err(Error::IoError)?;
                }
                let repo = Repository::init(path)?;
                repo.remote("origin", url)?;
                {
                    let mut remote = repo.find_remote("origin")?;
                    let mut fetch_options = FetchOptions::new();
                    fetch_options.remote_callbacks(creds.callbacks());
                    // fails on a truly empty remote; the unborn HEAD covers that
                    let _ = remote.fetch(&[] as &[&str], Some(&mut fetch_options), None);
                }
                repo.set_head(&format!("refs/heads/{branch}"))?;
                repo
            }
        };

        let checkout = Checkout {
            repo,
            path: path.to_path_buf(),
            branch: branch.to_string(),
        };
        // when the fetch brought the branch in after an init, materialize it
        if checkout.repo.find_reference(&checkout.branch_ref()).is_err() {
            let _ = checkout.reset_to_remote()?;
        }
        Ok(checkout)
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/origin/{}", self.branch)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch_exists(&self) -> bool {
        self.repo.find_reference(&self.branch_ref()).is_ok()
    }

    pub fn head_sha(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.target())
            .map(|oid| oid.to_string())
    }

    /// Local tip when the remote tracking ref does not match it, i.e. a
    /// commit from an earlier flush that never made it out.
    pub fn unpushed_head(&self) -> Option<String> {
        let head = self.repo.head().ok()?.target()?;
        let remote = self
            .repo
            .find_reference(&self.remote_ref())
            .ok()
            .and_then(|r| r.target());
        match remote {
            Some(remote) if remote == head => None,
            _ => Some(head.to_string()),
        }
    }

    fn workdir(&self) -> Result<&Path> {
        self.repo
            .workdir()
            .ok_or_else(|| Error::GitError(git2::Error::from_str("bare checkout")))
    }

    /// Apply mutations, dropping writes whose bytes already match the file.
    /// Deletes prune empty ancestor directories.
    pub fn apply(&self, mutations: &[FileMutation]) -> Result<AppliedChanges> {
        let workdir = self.workdir()?.to_path_buf();
        let mut changes = AppliedChanges::default();
        for mutation in mutations {
            let absolute = workdir.join(&mutation.path);
            match &mutation.op {
                MutationOp::Write(bytes) => {
                    if fs::read(&absolute).map(|cur| cur == *bytes).unwrap_or(false) {
                        continue;
                    }
                    if let Some(parent) = absolute.parent() {
                        fs::create_dir_all(parent).map_err(Error::IoError)?;
                    }
                    fs::write(&absolute, bytes).map_err(Error::IoError)?;
                    changes.written += 1;
                    changes.bytes += bytes.len();
                }
                MutationOp::Delete => {
                    if !absolute.exists() {
                        continue;
                    }
                    fs::remove_file(&absolute).map_err(Error::IoError)?;
                    changes.deleted += 1;
                    let mut dir = absolute.parent();
                    while let Some(d) = dir {
                        if d == workdir || fs::remove_dir(d).is_err() {
                            break;
                        }
                        dir = d.parent();
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Stage everything and commit; returns None when the tree is unchanged.
    pub fn commit(
        &self,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        match &parent {
            Some(parent) if parent.tree_id() == tree_id => return Ok(None),
            None if tree.is_empty() => return Ok(None),
            _ => {}
        }

        let author = Signature::now(author_name, author_email)?;
        let committer = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &author, &committer, message, &tree, &parents)?;
        Ok(Some(oid.to_string()))
    }

    /// Push the branch. The deadline cancels the transfer at the next
    /// progress callback once exceeded.
    pub fn push(&self, creds: &GitCredentials, deadline: Duration) -> Result<PushOutcome> {
        let mut remote = self.repo.find_remote("origin")?;
        let rejection: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen = rejection.clone();
        let start = Instant::now();
        let mut callbacks = creds.callbacks();
        callbacks.sideband_progress(move |_| start.elapsed() < deadline);
        callbacks.push_update_reference(move |refname, status| {
            if let Some(message) = status {
                *seen.lock().expect("push status lock poisoned") =
                    Some(format!("{refname}: {message}"));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("{r}:{r}", r = self.branch_ref());

        match remote.push(&[refspec], Some(&mut options)) {
            Ok(()) => {
                let rejected = rejection.lock().expect("push status lock poisoned").take();
                Ok(match rejected {
                    Some(message) => PushOutcome::Rejected(message),
                    None => PushOutcome::Pushed,
                })
            }
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                Ok(PushOutcome::Rejected(e.message().to_string()))
            }
            Err(e) => Err(Error::GitError(e)),
        }
    }

    /// Fetch the remote and return the tip of the tracked branch, if born.
    /// The deadline cancels the transfer at the next progress callback once
    /// exceeded.
    pub fn fetch(&self, creds: &GitCredentials, deadline: Duration) -> Result<Option<String>> {
        let mut remote = self.repo.find_remote("origin")?;
        let start = Instant::now();
        let mut callbacks = creds.callbacks();
        callbacks.transfer_progress(move |_| start.elapsed() < deadline);
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        remote.fetch(&[] as &[&str], Some(&mut options), None)?;
        Ok(self
            .repo
            .find_reference(&self.remote_ref())
            .ok()
            .and_then(|r| r.target())
            .map(|oid| oid.to_string()))
    }

    /// Hard-reset the local branch to the fetched remote tip. Returns false
    /// when the branch is not born on the remote.
    pub fn reset_to_remote(&self) -> Result<bool> {
        let Ok(reference) = self.repo.find_reference(&self.remote_ref()) else {
            return Ok(false);
        };
        let commit = reference.peel_to_commit()?;
        self.repo
            .reference(&self.branch_ref(), commit.id(), true, "reset to remote tip")?;
        self.repo.set_head(&self.branch_ref())?;
        self.repo.reset(
            commit.as_object(),
            ResetType::Hard,
            Some(CheckoutBuilder::new().force()),
        )?;
        Ok(true)
    }

    /// Tracked resource files under `base_folder`, relative to the checkout
    /// root. Dotfiles (the encryption config among them) are skipped.
    pub fn list_resource_files(&self, base_folder: &str) -> Result<Vec<PathBuf>> {
        let workdir = self.workdir()?.to_path_buf();
        let root = workdir.join(base_folder);
        let mut files = Vec::new();
        if root.is_dir() {
            walk(&workdir, &root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    /// Parse the base folder subtree back into resource identifiers.
    pub fn list_resources(&self, base_folder: &str) -> Result<Vec<ResourceIdentifier>> {
        Ok(self
            .list_resource_files(base_folder)?
            .iter()
            .filter_map(|path| ResourceIdentifier::from_repo_path(base_folder, path))
            .collect())
    }

    pub fn read_file(&self, relative: &Path) -> Result<Option<Vec<u8>>> {
        let absolute = self.workdir()?.join(relative);
        match fs::read(&absolute) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::IoError(e)),
        }
    }
}

fn walk(workdir: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(Error::IoError)? {
        let entry = entry.map_err(Error::IoError)?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk(workdir, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(workdir) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}
