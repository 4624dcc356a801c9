//! Session establishment and the transaction multiplexer.
//!
//! One [`Session`] owns one ordered transport stream. Many transactions may
//! be outstanding at once, distinguished by tag; the stream's read half is
//! owned by a single dispatcher task which correlates each inbound reply
//! with the waiting caller.
//!
//! # Protocol
//! 9P2000.L

use {
    crate::{
        error::Error,
        fcall::*,
        io_err, serialize,
        utils::{self, Result},
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, trace, warn},
    std::{
        collections::{HashMap, HashSet},
        fmt,
        sync::{
            Arc, Mutex as StdMutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{Mutex, oneshot},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

fn frame_codec() -> LengthDelimitedCodec {
    // 9P frames: size[4] (little-endian, counts itself) type[1] tag[2] ...
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

pub(crate) fn unexpected(expected: &'static str, got: &FCall) -> Error {
    Error::UnexpectedReply {
        expected,
        got: MsgType::from(got),
    }
}

/// Connection parameters consumed by the handshake.
///
/// These are resolved values; how they are obtained (config file, command
/// line) is the caller's business.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// User name sent in `TAttach`
    pub uname: String,
    /// File tree to attach to
    pub aname: String,
    /// Numeric uid sent as `n_uname`
    pub uid: u32,
    /// Group id used for `TlCreate`/`TMkDir`
    pub gid: u32,
    /// Maximum message size to propose
    pub msize: u32,
    /// Per-transaction timeout; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            uname: "root".to_owned(),
            aname: "/".to_owned(),
            uid: 0,
            gid: 0,
            msize: DEFAULT_MSIZE,
            timeout: None,
        }
    }
}

/// Number pool handing out fids and tags.
///
/// A number is recycled only after its previous holder released it.
struct NumPool {
    next: u32,
    limit: u32,
    free: Vec<u32>,
}

impl NumPool {
    fn new(limit: u32) -> NumPool {
        NumPool {
            next: 0,
            limit,
            free: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        if let Some(n) = self.free.pop() {
            return Some(n);
        }
        if self.next >= self.limit {
            return None;
        }
        let n = self.next;
        self.next += 1;
        Some(n)
    }

    fn release(&mut self, n: u32) {
        self.free.push(n);
    }
}

/// Shared connection state behind a `Session` and its fids.
pub(crate) struct Conn {
    writer: Mutex<Option<BoxedWriter>>,
    pending: StdMutex<HashMap<u16, oneshot::Sender<Msg>>>,
    tags: StdMutex<NumPool>,
    fids: StdMutex<NumPool>,
    live_fids: StdMutex<HashSet<u32>>,
    closed: AtomicBool,
    msize: AtomicU32,
    timeout: Option<Duration>,
}

impl Conn {
    fn new(writer: BoxedWriter, timeout: Option<Duration>) -> Conn {
        Conn {
            writer: Mutex::new(Some(writer)),
            pending: StdMutex::new(HashMap::new()),
            tags: StdMutex::new(NumPool::new(NOTAG as u32)),
            fids: StdMutex::new(NumPool::new(NOFID)),
            live_fids: StdMutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            msize: AtomicU32::new(DEFAULT_MSIZE),
            timeout,
        }
    }

    pub(crate) fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    fn set_msize(&self, msize: u32) {
        self.msize.store(msize, Ordering::Relaxed);
    }

    /// Largest payload of a single `TRead`/`TWrite`
    pub(crate) fn chunk_size(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ).max(1)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn alloc_fid(&self) -> Result<u32> {
        self.fids
            .lock()
            .unwrap()
            .alloc()
            .ok_or_else(|| Error::Io(io_err!(Other, "fid space exhausted")))
    }

    pub(crate) fn register_fid(&self, fid: u32) {
        self.live_fids.lock().unwrap().insert(fid);
    }

    /// Return a fid number to the pool once the server no longer knows it.
    pub(crate) fn release_fid(&self, fid: u32) {
        self.live_fids.lock().unwrap().remove(&fid);
        self.fids.lock().unwrap().release(fid);
    }

    fn alloc_tag(&self) -> Result<u16> {
        self.tags
            .lock()
            .unwrap()
            .alloc()
            .map(|t| t as u16)
            .ok_or_else(|| Error::Io(io_err!(Other, "tag space exhausted")))
    }

    fn release_tag(&self, tag: u16) {
        if tag != NOTAG {
            self.tags.lock().unwrap().release(tag as u32);
        }
    }

    /// Forget a transaction that never made it onto the wire.
    fn abandon(&self, tag: u16) {
        self.pending.lock().unwrap().remove(&tag);
        self.release_tag(tag);
    }

    /// Issue one transaction and wait for its reply.
    ///
    /// A server `Rlerror` comes back as `Error::No`. On timeout the tag
    /// stays reserved; the dispatcher recycles it when the late reply
    /// eventually arrives (and discards the reply).
    pub(crate) async fn rpc(&self, body: FCall) -> Result<FCall> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let tag = match body {
            FCall::TVersion { .. } => NOTAG,
            _ => self.alloc_tag()?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tag, tx);

        let msg = Msg { tag, body };
        trace!("→ {:?}", msg);

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        if let Err(e) = serialize::write_msg(&mut writer, &msg) {
            self.abandon(tag);
            return Err(e.into());
        }

        {
            let mut guard = self.writer.lock().await;
            let Some(framed) = guard.as_mut() else {
                self.abandon(tag);
                return Err(Error::ConnectionClosed);
            };
            if let Err(e) = framed.send(writer.into_inner().freeze()).await {
                self.abandon(tag);
                return Err(e.into());
            }
        }

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                // The tag remains reserved until the dispatcher resolves it.
                Err(_) => return Err(Error::Timeout),
            },
            None => rx.await,
        };

        let msg = reply.map_err(|_| Error::ConnectionClosed)?;
        trace!("← {:?}", msg);

        match msg.body {
            FCall::RlError { ecode } => Err(Error::from_ecode(ecode)),
            body => Ok(body),
        }
    }

    /// Resolve every pending transaction with `ConnectionClosed`.
    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a recv error.
        self.pending.lock().unwrap().clear();
    }

    async fn shut_transport(&self) {
        if let Some(mut framed) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = framed.get_mut().shutdown().await {
                debug!("transport shutdown: {}", e);
            }
        }
    }
}

/// Reader side of the multiplexer.
///
/// Sole owner of the transport's read half: decodes each inbound frame,
/// looks up its tag and resolves the matching pending transaction exactly
/// once. Survives malformed frames and unknown tags; ends on transport
/// EOF or error, failing everything still pending.
async fn dispatch(conn: Arc<Conn>, reader: BoxedReader) {
    let mut framedread = FramedRead::new(reader, frame_codec());

    while let Some(frame) = framedread.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("transport error: {}", e);
                break;
            }
        };

        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(e) => {
                // Framing is length-delimited, so the stream resynchronizes
                // at the next frame.
                error!("dropping frame: {}", Error::MalformedMessage(e.to_string()));
                continue;
            }
        };

        let slot = conn.pending.lock().unwrap().remove(&msg.tag);
        match slot {
            Some(tx) => {
                let tag = msg.tag;
                if tx.send(msg).is_err() {
                    debug!("discarding late reply for tag {}", tag);
                }
                conn.release_tag(tag);
            }
            None => {
                warn!(
                    "unexpected reply for unknown tag {}: {:?}",
                    msg.tag,
                    MsgType::from(&msg.body)
                );
            }
        }
    }

    conn.fail_pending();
}

/// An attached 9P2000.L session.
///
/// Created by [`Session::handshake`] or [`connect`]; the factory for fid
/// handles via [`Session::open`] and friends (see `fsops`). All fids a
/// session issued become invalid when it closes.
pub struct Session {
    conn: Arc<Conn>,
    dispatcher: tokio::task::JoinHandle<()>,
    root: u32,
    root_qid: QId,
    version: String,
    pub(crate) gid: u32,
}

impl Session {
    /// Perform version negotiation and attach over an established transport.
    pub async fn handshake<R, W>(reader: R, writer: W, opts: SessionOptions) -> Result<Session>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let framedwrite = FramedWrite::new(
            Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
            frame_codec(),
        );
        let conn = Arc::new(Conn::new(framedwrite, opts.timeout));
        let dispatcher = tokio::spawn(dispatch(conn.clone(), Box::new(reader)));

        match Self::negotiate(&conn, &opts).await {
            Ok(session_parts) => {
                let (root, root_qid, version) = session_parts;
                Ok(Session {
                    conn,
                    dispatcher,
                    root,
                    root_qid,
                    version,
                    gid: opts.gid,
                })
            }
            Err(e) => {
                conn.fail_pending();
                conn.shut_transport().await;
                dispatcher.abort();
                Err(e)
            }
        }
    }

    async fn negotiate(conn: &Arc<Conn>, opts: &SessionOptions) -> Result<(u32, QId, String)> {
        let proposed = opts.msize.max(IOHDRSZ + 1);
        let reply = conn
            .rpc(FCall::TVersion {
                msize: proposed,
                version: P92000L.to_owned(),
            })
            .await?;
        let version = match reply {
            FCall::RVersion { msize, version } => {
                if version != P92000L {
                    return Err(Error::IncompatibleVersion(version));
                }
                conn.set_msize(msize.min(proposed));
                version
            }
            other => return Err(unexpected("Rversion", &other)),
        };

        let root = conn.alloc_fid()?;
        let reply = conn
            .rpc(FCall::TAttach {
                fid: root,
                afid: NOFID,
                uname: opts.uname.clone(),
                aname: opts.aname.clone(),
                n_uname: opts.uid,
            })
            .await?;
        let root_qid = match reply {
            FCall::RAttach { qid } => qid,
            other => return Err(unexpected("Rattach", &other)),
        };
        conn.register_fid(root);

        debug!(
            "attached: version {:?} msize {} root qid {:?}",
            version,
            conn.msize(),
            root_qid
        );
        Ok((root, root_qid, version))
    }

    /// Negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.conn.msize()
    }

    /// Negotiated protocol version string
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Qid of the attach root
    pub fn root_qid(&self) -> QId {
        self.root_qid
    }

    pub(crate) fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub(crate) fn root(&self) -> u32 {
        self.root
    }

    /// Close the session.
    ///
    /// Clunks every live fid best-effort (failures are logged and
    /// swallowed), then shuts the transport down. Every fid handle issued
    /// by this session is dead afterwards.
    pub async fn close(&mut self) -> Result<()> {
        if self.conn.is_closed() {
            return Ok(());
        }

        let live: Vec<u32> = self.conn.live_fids.lock().unwrap().iter().copied().collect();
        for fid in live {
            if let Err(e) = self.conn.rpc(FCall::TClunk { fid }).await {
                debug!("clunk of fid {} at close: {}", fid, e);
            }
            self.conn.release_fid(fid);
        }

        self.conn.fail_pending();
        self.conn.shut_transport().await;
        self.dispatcher.abort();
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.root)
            .field("root_qid", &self.root_qid)
            .field("version", &self.version)
            .field("msize", &self.msize())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Connect to `proto!address!port` (`tcp` or `unix`) and attach.
pub async fn connect(addr: &str, opts: SessionOptions) -> Result<Session> {
    let (proto, host, port) = utils::parse_proto(addr)
        .ok_or_else(|| Error::Io(io_err!(InvalidInput, "Invalid protocol or address")))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
            let (readhalf, writehalf) = stream.into_split();
            Session::handshake(readhalf, writehalf, opts).await
        }
        "unix" => {
            let stream = UnixStream::connect(host).await?;
            let (readhalf, writehalf) = stream.into_split();
            Session::handshake(readhalf, writehalf, opts).await
        }
        _ => Err(Error::Io(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_pool_recycles_only_released_numbers() {
        let mut pool = NumPool::new(4);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        pool.release(0);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(2));
        assert_eq!(pool.alloc(), Some(3));
        assert_eq!(pool.alloc(), None);
        pool.release(2);
        assert_eq!(pool.alloc(), Some(2));
    }
}
