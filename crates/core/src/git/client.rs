//! libgit2-backed [`Repository`] over a bare local mirror.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use git2::{
    Cred, ErrorClass, ErrorCode, FetchOptions, FileMode, Oid, PushOptions,
    RemoteCallbacks, Signature,
};
use tracing::{debug, info, instrument, warn};

use super::{PushRequest, RemoteSnapshot, Repository, SNAPSHOT_FILE};
use crate::errors::GitError;

pub struct Git2Repository {
    path: PathBuf,
    url: String,
    remote_name: String,
    repo: Mutex<Option<git2::Repository>>,
}

impl Git2Repository {
    /// A backend mirroring `url` into a bare repository at `path`. An
    /// existing mirror is reused.
    pub fn new<P: AsRef<Path>>(path: P, url: &str, remote_name: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        let repo = git2::Repository::open_bare(&path).ok();
        if repo.is_some() {
            info!(path = %path.display(), "opened existing git mirror");
        }
        Self {
            path,
            url: url.to_string(),
            remote_name: remote_name.to_string(),
            repo: Mutex::new(repo),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<git2::Repository>> {
        self.repo.lock().unwrap_or_else(|poisoned| {
            warn!("git mirror mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Open the mirror, creating it (with the remote configured) on first use.
    fn ensure_mirror<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<git2::Repository>>,
        url: &str,
    ) -> Result<&'a git2::Repository, GitError> {
        if guard.is_none() {
            std::fs::create_dir_all(&self.path)?;
            let repo = git2::Repository::init_bare(&self.path)?;
            info!(path = %self.path.display(), "initialized bare git mirror");
            **guard = Some(repo);
        }
        let repo = guard
            .as_ref()
            .ok_or_else(|| GitError::RepositoryNotFound(self.path.display().to_string()))?;

        match repo.find_remote(&self.remote_name) {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => repo.remote_set_url(&self.remote_name, url)?,
            Err(_) => {
                repo.remote(&self.remote_name, url)?;
            }
        }
        Ok(repo)
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, branch)
    }

    fn fetch_all(&self, repo: &git2::Repository, token: Option<&str>) -> Result<(), GitError> {
        let mut remote = repo.find_remote(&self.remote_name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks(token));
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", self.remote_name);
        remote
            .fetch(&[refspec.as_str()], Some(&mut fetch_opts), None)
            .map_err(classify)?;
        debug!(remote = %self.remote_name, "fetch completed");
        Ok(())
    }

    fn remote_head(&self, repo: &git2::Repository, branch: &str) -> Result<Option<Oid>, GitError> {
        match repo.find_reference(&self.remote_ref(branch)) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_payload(repo: &git2::Repository, branch: &str, oid: Oid) -> Result<String, GitError> {
        let commit = repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let entry = tree
            .get_path(Path::new(SNAPSHOT_FILE))
            .map_err(|_| GitError::MalformedBranch {
                branch: branch.to_string(),
                detail: format!("commit {oid} has no {SNAPSHOT_FILE}"),
            })?;
        let object = entry.to_object(repo)?;
        let blob = object.peel_to_blob()?;
        String::from_utf8(blob.content().to_vec()).map_err(|e| GitError::MalformedBranch {
            branch: branch.to_string(),
            detail: format!("{SNAPSHOT_FILE} is not UTF-8: {e}"),
        })
    }
}

impl Repository for Git2Repository {
    #[instrument(skip(self, token), fields(path = %self.path.display()))]
    fn clone_remote(&self, url: &str, token: Option<&str>) -> Result<(), GitError> {
        info!(url, "mirroring remote repository");
        let mut guard = self.lock();
        let repo = self.ensure_mirror(&mut guard, url)?;
        self.fetch_all(repo, token)?;
        info!("mirror up to date");
        Ok(())
    }

    #[instrument(skip(self, token))]
    fn fetch_snapshot(
        &self,
        branch: &str,
        token: Option<&str>,
    ) -> Result<Option<RemoteSnapshot>, GitError> {
        let mut guard = self.lock();
        let repo = self.ensure_mirror(&mut guard, &self.url)?;
        self.fetch_all(repo, token)?;

        let Some(oid) = self.remote_head(repo, branch)? else {
            debug!(branch, "remote branch does not exist");
            return Ok(None);
        };
        let payload = Self::read_payload(repo, branch, oid)?;
        Ok(Some(RemoteSnapshot {
            commit_sha: oid.to_string(),
            payload,
        }))
    }

    #[instrument(skip(self, request, token), fields(branch = %request.branch))]
    fn push_snapshot(
        &self,
        request: &PushRequest,
        token: Option<&str>,
    ) -> Result<String, GitError> {
        let mut guard = self.lock();
        let repo = self.ensure_mirror(&mut guard, &self.url)?;
        self.fetch_all(repo, token)?;

        let current = self.remote_head(repo, &request.branch)?;
        let current_sha = current.map(|oid| oid.to_string());
        if current_sha != request.expected_head {
            return Err(GitError::PushRejected {
                branch: request.branch.clone(),
                detail: format!(
                    "remote head is {}, expected {}",
                    current_sha.as_deref().unwrap_or("<none>"),
                    request.expected_head.as_deref().unwrap_or("<none>")
                ),
            });
        }

        let blob = repo.blob(request.payload.as_bytes())?;
        let mut builder = repo.treebuilder(None)?;
        builder.insert(SNAPSHOT_FILE, blob, FileMode::Blob.into())?;
        let tree = repo.find_tree(builder.write()?)?;
        let signature = Signature::now(&request.author_name, &request.author_email)?;
        let parent = match current {
            Some(oid) => Some(repo.find_commit(oid)?),
            None => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(None, &signature, &signature, &request.message, &tree, &parents)?;

        let local_ref = format!("refs/heads/{}", request.branch);
        repo.reference(&local_ref, oid, true, "scenariosync: stage push")?;

        let rejection = Arc::new(Mutex::new(None::<String>));
        let rejection_slot = Arc::clone(&rejection);
        let mut cbs = callbacks(token);
        cbs.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = rejection_slot.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(cbs);

        let mut remote = repo.find_remote(&self.remote_name)?;
        let refspec = format!("{local_ref}:{local_ref}");
        remote
            .push(&[refspec.as_str()], Some(&mut push_opts))
            .map_err(|e| match classify(e) {
                GitError::Git2Error(e) if e.class() == ErrorClass::Reference => {
                    GitError::PushRejected {
                        branch: request.branch.clone(),
                        detail: e.message().to_string(),
                    }
                }
                other => other,
            })?;

        let rejected = rejection.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detail) = rejected {
            return Err(GitError::PushRejected {
                branch: request.branch.clone(),
                detail,
            });
        }

        repo.reference(
            &self.remote_ref(&request.branch),
            oid,
            true,
            "scenariosync: push",
        )?;
        info!(sha = %oid, "pushed scenario snapshot");
        Ok(oid.to_string())
    }
}

fn callbacks(token: Option<&str>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(tok) = token {
        let tok = tok.to_string();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", &tok)
        });
    }
    callbacks
}

/// Sort libgit2 failures into network, authentication and other errors.
fn classify(err: git2::Error) -> GitError {
    if err.code() == ErrorCode::Auth {
        return GitError::AuthenticationFailed(err.message().to_string());
    }
    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Ssh => {
            GitError::Network(err.message().to_string())
        }
        _ => GitError::Git2Error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(branch: &str, expected: Option<&str>, payload: &str) -> PushRequest {
        PushRequest {
            branch: branch.into(),
            expected_head: expected.map(str::to_string),
            payload: payload.into(),
            message: "sync".into(),
            author_name: "alice".into(),
            author_email: "alice@example.com".into(),
        }
    }

    fn origin() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        git2::Repository::init_bare(&origin).unwrap();
        let url = origin.to_string_lossy().into_owned();
        (dir, url)
    }

    #[test]
    fn test_push_then_fetch_round_trip() {
        let (dir, url) = origin();
        let mirror = Git2Repository::new(dir.path().join("mirror"), &url, "origin");
        mirror.clone_remote(&url, None).unwrap();
        assert!(mirror.fetch_snapshot("main", None).unwrap().is_none());

        let sha = mirror
            .push_snapshot(&request("main", None, r#"{"schemaVersion":1}"#), None)
            .unwrap();
        let fetched = mirror.fetch_snapshot("main", None).unwrap().unwrap();
        assert_eq!(fetched.commit_sha, sha);
        assert_eq!(fetched.payload, r#"{"schemaVersion":1}"#);

        let next = mirror
            .push_snapshot(&request("main", Some(&sha), r#"{"schemaVersion":1,"n":2}"#), None)
            .unwrap();
        assert_ne!(next, sha);
    }

    #[test]
    fn test_stale_expected_head_is_rejected() {
        let (dir, url) = origin();
        let a = Git2Repository::new(dir.path().join("a"), &url, "origin");
        let b = Git2Repository::new(dir.path().join("b"), &url, "origin");

        let first = a.push_snapshot(&request("main", None, "one"), None).unwrap();
        let err = b.push_snapshot(&request("main", None, "two"), None).unwrap_err();
        assert!(matches!(err, GitError::PushRejected { .. }));

        b.push_snapshot(&request("main", Some(&first), "two"), None)
            .unwrap();
        let err = a
            .push_snapshot(&request("main", Some(&first), "three"), None)
            .unwrap_err();
        assert!(matches!(err, GitError::PushRejected { .. }));
    }

    #[test]
    fn test_branch_without_snapshot_file_is_malformed() {
        let (dir, url) = origin();
        let origin = git2::Repository::open_bare(&url).unwrap();
        let blob = origin.blob(b"hello").unwrap();
        let mut builder = origin.treebuilder(None).unwrap();
        builder.insert("README", blob, 0o100644).unwrap();
        let tree = origin.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("x", "x@example.com").unwrap();
        origin
            .commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        let mirror = Git2Repository::new(dir.path().join("mirror"), &url, "origin");
        let err = mirror.fetch_snapshot("main", None).unwrap_err();
        assert!(matches!(err, GitError::MalformedBranch { .. }));
    }
}
