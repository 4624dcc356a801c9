//! Path-level operations built on the session: the directory walker,
//! open/create by path, single remove, and the recursive delete engine.

use {
    crate::{
        client::{Session, unexpected},
        error::Error,
        fcall::*,
        fid::Fid,
        io_err,
        utils::Result,
    },
    futures::future::BoxFuture,
    log::{debug, warn},
    std::fmt,
};

fn components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_owned)
        .collect()
}

fn split_dir_name(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// The outcome of a failed [`Session::rmrf`].
///
/// Carries the first failure encountered and how many entries are still
/// present under the requested root.
#[derive(Debug)]
pub struct RmrfError {
    pub first: Error,
    pub remaining: u64,
}

impl fmt::Display for RmrfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recursive delete left {} entries behind, first failure: {}",
            self.remaining, self.first
        )
    }
}

impl std::error::Error for RmrfError {}

impl Session {
    /// Resolve `path` (relative to the attach root) into a fid handle.
    ///
    /// Components are batched up to `MAXWELEM` per walk transaction. A walk
    /// that stops short fails with `WalkIncomplete`, reporting how many
    /// components did resolve.
    pub async fn walk(&self, path: &str) -> Result<Fid> {
        let conn = self.conn().clone();
        let names = components(path);
        let requested = names.len();

        let newfid = conn.alloc_fid()?;
        let mut qid = self.root_qid();
        let mut resolved = 0;
        let mut base = self.root();

        // A zero-component walk still runs once, cloning the base fid.
        let mut chunks: Vec<&[String]> = names.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        for chunk in chunks {
            let reply = match conn
                .rpc(FCall::TWalk {
                    fid: base,
                    newfid,
                    wnames: chunk.to_vec(),
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    if resolved > 0 {
                        // newfid exists server-side from the previous chunk
                        let _ = conn.rpc(FCall::TClunk { fid: newfid }).await;
                    }
                    conn.release_fid(newfid);
                    return Err(match e {
                        Error::No(errno) if errno == crate::error::errno::ENOENT => {
                            Error::WalkIncomplete {
                                resolved,
                                requested,
                            }
                        }
                        e => e,
                    });
                }
            };
            let wqids = match reply {
                FCall::RWalk { wqids } => wqids,
                other => {
                    conn.release_fid(newfid);
                    return Err(unexpected("Rwalk", &other));
                }
            };

            if wqids.len() < chunk.len() {
                let partial = wqids.len();
                if resolved > 0 {
                    // newfid exists server-side from the previous chunk; a
                    // short continuation walk leaves it untouched.
                    let _ = conn.rpc(FCall::TClunk { fid: newfid }).await;
                }
                resolved += partial;
                conn.release_fid(newfid);
                return Err(Error::WalkIncomplete {
                    resolved,
                    requested,
                });
            }

            resolved += wqids.len();
            if let Some(last) = wqids.last() {
                qid = *last;
            }
            // Continue the walk from the fid we just created.
            base = newfid;
        }

        conn.register_fid(newfid);
        Ok(Fid::new(conn, newfid, components(path).join("/"), qid))
    }

    /// Open (or create) the file at `path`.
    ///
    /// With `CREATE`, a missing final component is created under its parent
    /// directory with `mode`; `EXCL` surfaces the server's `EEXIST` when
    /// the name is already taken.
    pub async fn open(&self, path: &str, flags: OpenFlags, mode: Mode) -> Result<Fid> {
        if !flags.contains(OpenFlags::CREATE) {
            let mut fid = self.walk(path).await?;
            fid.open(flags).await?;
            return Ok(fid);
        }

        let (dir, name) = split_dir_name(path);
        if name.is_empty() {
            return Err(Error::Io(io_err!(InvalidInput, "empty file name")));
        }

        if !flags.contains(OpenFlags::EXCL) {
            match self.walk(path).await {
                Ok(mut fid) => {
                    fid.open(flags & !(OpenFlags::CREATE)).await?;
                    return Ok(fid);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut fid = self.walk(dir).await?;
        fid.create(name, flags, mode, self.gid).await?;
        Ok(fid)
    }

    /// Create the directory at `path`.
    pub async fn mkdir(&self, path: &str, mode: Mode) -> Result<QId> {
        let (dir, name) = split_dir_name(path);
        if name.is_empty() {
            return Err(Error::Io(io_err!(InvalidInput, "empty directory name")));
        }

        let mut parent = self.walk(dir).await?;
        let res = self
            .conn()
            .rpc(FCall::TMkDir {
                dfid: parent.num(),
                name: name.to_owned(),
                mode: mode.bits(),
                gid: self.gid,
            })
            .await;
        let _ = parent.clunk().await;
        match res? {
            FCall::RMkDir { qid } => Ok(qid),
            other => Err(unexpected("Rmkdir", &other)),
        }
    }

    /// Fetch the attributes of `path`.
    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let mut fid = self.walk(path).await?;
        let res = fid.stat().await;
        let _ = fid.clunk().await;
        res
    }

    /// Remove the single entry at `path`, no recursion.
    ///
    /// A path that does not exist fails with not-found; contrast with
    /// [`Session::rmrf`], which treats an entry vanishing mid-walk as
    /// success.
    pub async fn rm(&self, path: &str) -> Result<()> {
        let mut fid = self.walk(path).await?;
        fid.unlink().await
    }

    /// Remove `path` and everything beneath it, depth-first.
    ///
    /// Children are removed before the directory containing them. A child
    /// that fails to delete is recorded and its siblings are still
    /// processed, but no ancestor of a failure is ever attempted (removing
    /// a non-empty directory would fail anyway). An entry that disappears
    /// between enumeration and removal counts as removed: the end state
    /// matches the intent.
    pub async fn rmrf(&self, path: &str) -> ::std::result::Result<(), RmrfError> {
        let fid = match self.walk(path).await {
            Ok(fid) => fid,
            Err(e) => {
                return Err(RmrfError {
                    first: e,
                    remaining: 0,
                });
            }
        };

        let root = components(path).join("/");
        self.remove_tree(root, fid)
            .await
            .map_err(|(first, remaining)| RmrfError { first, remaining })
    }

    /// Depth-first removal of one entry. Returns how many entries remain in
    /// the subtree alongside the first error.
    fn remove_tree(
        &self,
        path: String,
        mut fid: Fid,
    ) -> BoxFuture<'_, ::std::result::Result<(), (Error, u64)>> {
        Box::pin(async move {
            if !fid.is_dir() {
                return match fid.unlink().await {
                    Ok(()) => Ok(()),
                    // Vanished between enumeration and removal: the entry is
                    // gone, which is what we wanted.
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err((e, 1)),
                };
            }

            // Enumerate completely before deleting anything.
            let entries = match fid.dirents().await {
                Ok(entries) => entries,
                Err(e) => {
                    let _ = fid.clunk().await;
                    return Err((e, 1));
                }
            };

            let mut first_err = None;
            let mut remaining = 0u64;

            for entry in entries {
                let child_path = join(&path, &entry.name);
                let child = match self.walk(&child_path).await {
                    Ok(child) => child,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => {
                        warn!("rmrf: cannot reach {}: {}", child_path, e);
                        remaining += 1;
                        first_err.get_or_insert(e);
                        continue;
                    }
                };
                if let Err((e, n)) = self.remove_tree(child_path, child).await {
                    remaining += n;
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        debug!("rmrf: additional failure: {}", e);
                    }
                }
            }

            match first_err {
                Some(first) => {
                    // The directory still has children; do not try to
                    // remove it.
                    let _ = fid.clunk().await;
                    Err((first, remaining + 1))
                }
                None => match fid.unlink().await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err((e, 1)),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_normalizes() {
        assert_eq!(components("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(components("/a//b/./c/"), vec!["a", "b", "c"]);
        assert!(components("/").is_empty());
        assert!(components("").is_empty());
    }

    #[test]
    fn split_dir_name_forms() {
        assert_eq!(split_dir_name("a/b/c"), ("a/b", "c"));
        assert_eq!(split_dir_name("c"), ("", "c"));
        assert_eq!(split_dir_name("a/b/"), ("a", "b"));
        assert_eq!(split_dir_name("/a"), ("", "a"));
    }

    #[test]
    fn join_forms() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
        assert_eq!(join("a/", "b"), "a/b");
    }
}
