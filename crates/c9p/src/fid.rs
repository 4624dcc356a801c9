//! Fid handles: one open remote file or directory each.
//!
//! A [`Fid`] owns its fid number for as long as it is live. Operations take
//! `&mut self`; the protocol assumes at most one in-flight transaction per
//! fid, and the borrow rules encode exactly that. Distinct fids on the same
//! session may be driven concurrently.
//!
//! # Protocol
//! 9P2000.L

use {
    crate::{
        client::{Conn, unexpected},
        error::Error,
        fcall::*,
        io_err,
        utils::Result,
    },
    log::debug,
    std::{fmt, sync::Arc},
};

/// Handle state: `Created → Open → Closed` (terminal, by clunk or remove).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FidState {
    Created,
    Open,
    Closed,
}

/// A handle to one remote filesystem object.
pub struct Fid {
    conn: Arc<Conn>,
    num: u32,
    path: String,
    qid: QId,
    iounit: u32,
    state: FidState,
    attr: Option<Stat>,
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fid")
            .field("num", &self.num)
            .field("path", &self.path)
            .field("qid", &self.qid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Fid {
    pub(crate) fn new(conn: Arc<Conn>, num: u32, path: String, qid: QId) -> Fid {
        Fid {
            conn,
            num,
            path,
            qid,
            iounit: 0,
            state: FidState::Created,
            attr: None,
        }
    }

    pub(crate) fn num(&self) -> u32 {
        self.num
    }

    /// The remote path this fid resolved to
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last-known qid. A change under the same name means a different
    /// object now occupies it.
    pub fn qid(&self) -> QId {
        self.qid
    }

    /// Whether this fid names a directory
    pub fn is_dir(&self) -> bool {
        self.qid.is_dir()
    }

    /// Attributes cached by the last `stat` call, if any
    pub fn cached_stat(&self) -> Option<&Stat> {
        self.attr.as_ref()
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            FidState::Closed => Err(Error::HandleClosed),
            _ => Ok(()),
        }
    }

    fn chunk(&self) -> u32 {
        let chunk = self.conn.chunk_size();
        if self.iounit > 0 { chunk.min(self.iounit) } else { chunk }
    }

    /// Fetch the current attributes and refresh the cached qid.
    pub async fn stat(&mut self) -> Result<Stat> {
        self.ensure_live()?;
        let reply = self
            .conn
            .rpc(FCall::TGetAttr {
                fid: self.num,
                req_mask: GetAttrMask::BASIC,
            })
            .await?;
        match reply {
            FCall::RGetAttr { qid, stat, .. } => {
                self.qid = qid;
                self.attr = Some(stat);
                Ok(stat)
            }
            other => Err(unexpected("Rgetattr", &other)),
        }
    }

    async fn setattr(&mut self, valid: SetAttrMask, stat: SetAttr) -> Result<()> {
        self.ensure_live()?;
        let reply = self
            .conn
            .rpc(FCall::TSetAttr {
                fid: self.num,
                valid,
                stat,
            })
            .await?;
        match reply {
            FCall::RSetAttr => Ok(()),
            other => Err(unexpected("Rsetattr", &other)),
        }
    }

    /// Change the permission bits, leaving everything else untouched.
    pub async fn chmod(&mut self, mode: Mode) -> Result<()> {
        self.setattr(
            SetAttrMask::MODE,
            SetAttr {
                mode: mode.bits(),
                ..Default::default()
            },
        )
        .await
    }

    /// Change owner and group in one atomic partial update.
    pub async fn chown(&mut self, uid: u32, gid: u32) -> Result<()> {
        self.setattr(
            SetAttrMask::UID | SetAttrMask::GID,
            SetAttr {
                uid,
                gid,
                ..Default::default()
            },
        )
        .await
    }

    /// Open this fid for I/O.
    pub async fn open(&mut self, flags: OpenFlags) -> Result<()> {
        self.ensure_live()?;
        if self.state == FidState::Open {
            return Err(Error::Io(io_err!(InvalidInput, "fid is already open")));
        }
        let reply = self
            .conn
            .rpc(FCall::TlOpen {
                fid: self.num,
                flags: flags.bits(),
            })
            .await?;
        match reply {
            FCall::RlOpen { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                self.state = FidState::Open;
                Ok(())
            }
            other => Err(unexpected("Rlopen", &other)),
        }
    }

    /// Create `name` under this directory fid.
    ///
    /// On success the handle stops naming the directory and becomes the
    /// created, open file; the walk that produced this fid is the caller's
    /// guarantee that the parent is positioned correctly.
    pub async fn create(
        &mut self,
        name: &str,
        flags: OpenFlags,
        mode: Mode,
        gid: u32,
    ) -> Result<()> {
        self.ensure_live()?;
        let reply = self
            .conn
            .rpc(FCall::TlCreate {
                fid: self.num,
                name: name.to_owned(),
                flags: flags.bits(),
                mode: mode.bits(),
                gid,
            })
            .await?;
        match reply {
            FCall::RlCreate { qid, iounit } => {
                if !self.path.is_empty() && !self.path.ends_with('/') {
                    self.path.push('/');
                }
                self.path.push_str(name);
                self.qid = qid;
                self.iounit = iounit;
                self.state = FidState::Open;
                Ok(())
            }
            other => Err(unexpected("Rlcreate", &other)),
        }
    }

    /// Read up to `count` bytes at `offset` in a single transaction.
    pub async fn read_at(&mut self, offset: u64, count: u32) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let reply = self
            .conn
            .rpc(FCall::TRead {
                fid: self.num,
                offset,
                count: count.min(self.chunk()),
            })
            .await?;
        match reply {
            FCall::RRead { data } => Ok(data.0),
            other => Err(unexpected("Rread", &other)),
        }
    }

    /// Write `data` at `offset` in a single transaction; returns the number
    /// of bytes the server accepted.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<u32> {
        self.ensure_live()?;
        let chunk = (self.chunk() as usize).min(data.len());
        let reply = self
            .conn
            .rpc(FCall::TWrite {
                fid: self.num,
                offset,
                data: Data(data[..chunk].to_vec()),
            })
            .await?;
        match reply {
            FCall::RWrite { count } => Ok(count),
            other => Err(unexpected("Rwrite", &other)),
        }
    }

    /// Read from `offset` to end of file, chunked to the negotiated
    /// message size.
    pub async fn read_to_end(&mut self, offset: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let data = self.read_at(offset + out.len() as u64, self.chunk()).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    /// Write all of `data` at `offset`, chunked to the negotiated message
    /// size. A server that stops accepting bytes surfaces as
    /// `IncompleteWrite`.
    pub async fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut wrote = 0u64;
        while (wrote as usize) < data.len() {
            let count = self.write_at(offset + wrote, &data[wrote as usize..]).await?;
            if count == 0 {
                return Err(Error::IncompleteWrite {
                    wrote,
                    expected: data.len() as u64,
                });
            }
            wrote += count as u64;
        }
        Ok(())
    }

    /// Enumerate this directory in protocol order.
    ///
    /// Opens the fid read-only if it is not open yet. `.` and `..` are
    /// filtered out. The order is server-defined; no sorting is assumed.
    pub async fn dirents(&mut self) -> Result<Vec<DirEntry>> {
        self.ensure_live()?;
        if self.state != FidState::Open {
            self.open(OpenFlags::RDONLY | OpenFlags::DIRECTORY).await?;
        }

        let count = self.conn.msize().saturating_sub(READDIRHDRSZ);
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let reply = self
                .conn
                .rpc(FCall::TReadDir {
                    fid: self.num,
                    offset,
                    count,
                })
                .await?;
            let data = match reply {
                FCall::RReadDir { data } => data,
                other => return Err(unexpected("Rreaddir", &other)),
            };
            if data.is_empty() {
                break;
            }
            offset = data.data().last().map(|e| e.offset).unwrap_or(offset);
            entries.extend(
                data.data
                    .into_iter()
                    .filter(|e| e.name != "." && e.name != ".."),
            );
        }
        Ok(entries)
    }

    /// Read the value of extended attribute `name`, up to `max_size` bytes.
    ///
    /// An empty `name` retrieves the attribute listing (NUL-delimited); a
    /// listing truncated at `max_size` is not necessarily complete.
    pub async fn xattrget(&mut self, name: &str, max_size: u64) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let newfid = self.conn.alloc_fid()?;
        let reply = self
            .conn
            .rpc(FCall::TxAttrWalk {
                fid: self.num,
                newfid,
                name: name.to_owned(),
            })
            .await;
        let size = match reply {
            Ok(FCall::RxAttrWalk { size }) => size,
            Ok(other) => {
                self.conn.release_fid(newfid);
                return Err(unexpected("Rxattrwalk", &other));
            }
            Err(e) => {
                self.conn.release_fid(newfid);
                return Err(e);
            }
        };
        self.conn.register_fid(newfid);

        let limit = size.min(max_size);
        let mut value = Vec::with_capacity(limit as usize);
        let mut res = Ok(());
        while (value.len() as u64) < limit {
            let count = (limit - value.len() as u64).min(self.chunk() as u64) as u32;
            match self
                .conn
                .rpc(FCall::TRead {
                    fid: newfid,
                    offset: value.len() as u64,
                    count,
                })
                .await
            {
                Ok(FCall::RRead { data }) if data.0.is_empty() => break,
                Ok(FCall::RRead { data }) => value.extend_from_slice(&data.0),
                Ok(other) => {
                    res = Err(unexpected("Rread", &other));
                    break;
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = self.conn.rpc(FCall::TClunk { fid: newfid }).await {
            debug!("clunk of xattr fid {}: {}", newfid, e);
        }
        self.conn.release_fid(newfid);

        // The read loop never exceeds limit, which is capped at max_size.
        res.map(|_| value)
    }

    /// List the extended attribute names, reading at most `max_size` bytes
    /// of the underlying listing.
    pub async fn xattrlist(&mut self, max_size: u64) -> Result<Vec<String>> {
        let listing = self.xattrget("", max_size).await?;
        Ok(listing
            .split(|b| *b == 0 || *b == b'\n')
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    /// Set extended attribute `name` to `value`; returns the number of
    /// bytes written.
    ///
    /// A zero-length `value` removes the attribute; the server treats it as
    /// a delete, not as an empty value that persists. Callers should treat
    /// a return smaller than `value.len()` as an incomplete write.
    pub async fn xattrset(&mut self, name: &str, value: &[u8]) -> Result<u64> {
        self.ensure_live()?;
        if name.is_empty() {
            return Err(Error::Io(io_err!(InvalidInput, "empty attribute name")));
        }

        // Clone this fid; the clone carries the pending attribute write and
        // the clunk below is its commit point.
        let newfid = self.conn.alloc_fid()?;
        match self
            .conn
            .rpc(FCall::TWalk {
                fid: self.num,
                newfid,
                wnames: Vec::new(),
            })
            .await
        {
            Ok(FCall::RWalk { .. }) => {}
            Ok(other) => {
                self.conn.release_fid(newfid);
                return Err(unexpected("Rwalk", &other));
            }
            Err(e) => {
                self.conn.release_fid(newfid);
                return Err(e);
            }
        }
        self.conn.register_fid(newfid);

        let mut res = match self
            .conn
            .rpc(FCall::TxAttrCreate {
                fid: newfid,
                name: name.to_owned(),
                attr_size: value.len() as u64,
                flags: 0,
            })
            .await
        {
            Ok(FCall::RxAttrCreate) => Ok(0u64),
            Ok(other) => Err(unexpected("Rxattrcreate", &other)),
            Err(e) => Err(e),
        };

        if let Ok(ref mut wrote) = res {
            while (*wrote as usize) < value.len() {
                let chunk = (value.len() - *wrote as usize).min(self.chunk() as usize);
                let start = *wrote as usize;
                match self
                    .conn
                    .rpc(FCall::TWrite {
                        fid: newfid,
                        offset: *wrote,
                        data: Data(value[start..start + chunk].to_vec()),
                    })
                    .await
                {
                    Ok(FCall::RWrite { count }) if count == 0 => break,
                    Ok(FCall::RWrite { count }) => *wrote += count as u64,
                    Ok(other) => {
                        res = Err(unexpected("Rwrite", &other));
                        break;
                    }
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.conn.rpc(FCall::TClunk { fid: newfid }).await {
            debug!("clunk of xattr fid {}: {}", newfid, e);
            if res.is_ok() {
                res = Err(e);
            }
        }
        self.conn.release_fid(newfid);

        res
    }

    /// Remove the remote object this fid names.
    ///
    /// The protocol clunks the fid whether or not the remove succeeds, so
    /// the handle is terminal afterwards either way.
    pub async fn unlink(&mut self) -> Result<()> {
        self.ensure_live()?;
        let res = self.conn.rpc(FCall::TRemove { fid: self.num }).await;
        self.state = FidState::Closed;
        self.conn.release_fid(self.num);
        match res {
            Ok(FCall::RRemove) => Ok(()),
            Ok(other) => Err(unexpected("Rremove", &other)),
            Err(e) => Err(e),
        }
    }

    /// Release the fid number without touching the remote object.
    ///
    /// Idempotent-once: a second clunk fails with `HandleClosed`.
    pub async fn clunk(&mut self) -> Result<()> {
        self.ensure_live()?;
        let res = self.conn.rpc(FCall::TClunk { fid: self.num }).await;
        self.state = FidState::Closed;
        self.conn.release_fid(self.num);
        match res {
            Ok(FCall::RClunk) => Ok(()),
            Ok(other) => Err(unexpected("Rclunk", &other)),
            Err(e) => Err(e),
        }
    }
}
