//! Behavioral tests against an in-process 9P2000.L server.
//!
//! The mock server speaks the wire protocol over a `tokio::io::duplex`
//! pair and keeps its tree in a path-keyed map, which lets the tests
//! inject failures (permission denials, entries vanishing between
//! enumeration and removal) and reply reordering.

use {
    c9p::{
        Error, Mode, OpenFlags, Session, SessionOptions,
        fcall::*,
        serialize::{read_msg, write_msg},
    },
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        io::Cursor,
        sync::{Arc, Mutex},
    },
    tokio::io::{AsyncReadExt, AsyncWriteExt},
};

const ENOENT: u32 = 2;
const EACCES: u32 = 13;
const EEXIST: u32 = 17;
const ENOTEMPTY: u32 = 39;

#[derive(Clone)]
struct Node {
    dir: bool,
    mode: u32,
    uid: u32,
    gid: u32,
    qid_path: u64,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn qid(&self) -> QId {
        QId {
            typ: if self.dir { QIdType::DIR } else { QIdType::FILE },
            version: 0,
            path: self.qid_path,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlink: 1,
            size: 0,
            ..Default::default()
        }
    }
}

/// What a fid currently refers to inside the mock.
enum FidEnt {
    Path(String),
    /// `Txattrwalk` result: a readable attribute value
    XattrRead(Vec<u8>),
    /// `Txattrcreate` in progress: path, name, promised size, bytes so far
    XattrWrite(String, String, u64, Vec<u8>),
    /// Snapshot taken at the first `Treaddir`
    DirSnapshot(String, Vec<(String, QId)>),
}

#[derive(Default)]
struct Store {
    nodes: HashMap<String, Node>,
    next_qid: u64,
    /// Paths whose removal fails with EACCES
    deny_remove: HashSet<String>,
    /// Paths that disappear right after they have been enumerated
    vanish: HashSet<String>,
}

impl Store {
    fn new() -> Store {
        let mut store = Store::default();
        store.insert("", true, 0o755);
        store
    }

    fn insert(&mut self, path: &str, dir: bool, mode: u32) {
        let qid_path = self.next_qid;
        self.next_qid += 1;
        let typ = if dir { 0o040000 } else { 0o100000 };
        self.nodes.insert(
            path.to_owned(),
            Node {
                dir,
                mode: typ | mode,
                uid: 0,
                gid: 0,
                qid_path,
                xattrs: BTreeMap::new(),
            },
        );
    }

    fn children(&self, dir: &str) -> Vec<(String, QId)> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let mut out: Vec<(String, QId)> = self
            .nodes
            .iter()
            .filter(|(path, _)| {
                !path.is_empty()
                    && path.starts_with(&prefix)
                    && !path[prefix.len()..].contains('/')
            })
            .map(|(path, node)| (path[prefix.len()..].to_owned(), node.qid()))
            .collect();
        out.sort();
        out
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.nodes
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }
}

struct MockOptions {
    version: String,
    /// Hold each `Rgetattr` back until the next reply goes out
    reorder_getattr: bool,
    /// Sleep before sending each `Rgetattr`
    delay_getattr: Option<std::time::Duration>,
    /// Drop the transport right after the attach completes
    die_after_attach: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            version: P92000L.to_owned(),
            reorder_getattr: false,
            delay_getattr: None,
            die_after_attach: false,
        }
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn rlerror(ecode: u32) -> FCall {
    FCall::RlError { ecode }
}

fn handle(
    store: &Mutex<Store>,
    fids: &mut HashMap<u32, FidEnt>,
    opts: &MockOptions,
    body: FCall,
) -> FCall {
    let mut store = store.lock().unwrap();
    match body {
        FCall::TVersion { msize, .. } => FCall::RVersion {
            msize: msize.min(64 * 1024),
            version: opts.version.clone(),
        },
        FCall::TAttach { fid, .. } => {
            fids.insert(fid, FidEnt::Path(String::new()));
            FCall::RAttach {
                qid: store.nodes[""].qid(),
            }
        }
        FCall::TWalk { fid, newfid, wnames } => {
            let base = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            let mut path = base;
            let mut wqids = Vec::new();
            for name in &wnames {
                let next = join_path(&path, name);
                match store.nodes.get(&next) {
                    Some(node) if !store.vanish.contains(&next) => {
                        wqids.push(node.qid());
                        path = next;
                    }
                    _ => {
                        if wqids.is_empty() {
                            return rlerror(ENOENT);
                        }
                        return FCall::RWalk { wqids };
                    }
                }
            }
            fids.insert(newfid, FidEnt::Path(path));
            FCall::RWalk { wqids }
        }
        FCall::TlOpen { fid, .. } => {
            let path = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            match store.nodes.get(&path) {
                Some(node) => FCall::RlOpen {
                    qid: node.qid(),
                    iounit: 0,
                },
                None => rlerror(ENOENT),
            }
        }
        FCall::TlCreate { fid, name, mode, gid, .. } => {
            let dir = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            let path = join_path(&dir, &name);
            if store.nodes.contains_key(&path) {
                return rlerror(EEXIST);
            }
            store.insert(&path, false, mode & 0o7777);
            store.nodes.get_mut(&path).unwrap().gid = gid;
            let qid = store.nodes[&path].qid();
            fids.insert(fid, FidEnt::Path(path));
            FCall::RlCreate { qid, iounit: 0 }
        }
        FCall::TMkDir { dfid, name, mode, gid } => {
            let dir = match fids.get(&dfid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            let path = join_path(&dir, &name);
            store.insert(&path, true, mode & 0o7777);
            store.nodes.get_mut(&path).unwrap().gid = gid;
            FCall::RMkDir {
                qid: store.nodes[&path].qid(),
            }
        }
        FCall::TGetAttr { fid, .. } => {
            let path = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            match store.nodes.get(&path) {
                Some(node) => FCall::RGetAttr {
                    valid: GetAttrMask::BASIC,
                    qid: node.qid(),
                    stat: node.stat(),
                },
                None => rlerror(ENOENT),
            }
        }
        FCall::TSetAttr { fid, valid, stat } => {
            let path = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            match store.nodes.get_mut(&path) {
                Some(node) => {
                    if valid.contains(SetAttrMask::MODE) {
                        node.mode = (node.mode & !0o7777) | (stat.mode & 0o7777);
                    }
                    if valid.contains(SetAttrMask::UID) {
                        node.uid = stat.uid;
                    }
                    if valid.contains(SetAttrMask::GID) {
                        node.gid = stat.gid;
                    }
                    FCall::RSetAttr
                }
                None => rlerror(ENOENT),
            }
        }
        FCall::TxAttrWalk { fid, newfid, name } => {
            let path = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            let node = match store.nodes.get(&path) {
                Some(node) => node,
                None => return rlerror(ENOENT),
            };
            let value = if name.is_empty() {
                let mut listing = Vec::new();
                for key in node.xattrs.keys() {
                    listing.extend_from_slice(key.as_bytes());
                    listing.push(0);
                }
                listing
            } else {
                match node.xattrs.get(&name) {
                    Some(value) => value.clone(),
                    None => return rlerror(ENOENT),
                }
            };
            let size = value.len() as u64;
            fids.insert(newfid, FidEnt::XattrRead(value));
            FCall::RxAttrWalk { size }
        }
        FCall::TxAttrCreate { fid, name, attr_size, .. } => {
            let path = match fids.get(&fid) {
                Some(FidEnt::Path(p)) => p.clone(),
                _ => return rlerror(EACCES),
            };
            fids.insert(fid, FidEnt::XattrWrite(path, name, attr_size, Vec::new()));
            FCall::RxAttrCreate
        }
        FCall::TRead { fid, offset, count } => {
            let value = match fids.get(&fid) {
                Some(FidEnt::XattrRead(value)) => value,
                _ => return rlerror(EACCES),
            };
            let start = (offset as usize).min(value.len());
            let end = (start + count as usize).min(value.len());
            FCall::RRead {
                data: Data(value[start..end].to_vec()),
            }
        }
        FCall::TWrite { fid, data, .. } => {
            match fids.get_mut(&fid) {
                Some(FidEnt::XattrWrite(_, _, _, buf)) => {
                    buf.extend_from_slice(&data.0);
                    FCall::RWrite {
                        count: data.0.len() as u32,
                    }
                }
                _ => rlerror(EACCES),
            }
        }
        FCall::TReadDir { fid, offset, .. } => {
            if offset == 0 {
                let path = match fids.get(&fid) {
                    Some(FidEnt::Path(p)) => p.clone(),
                    Some(FidEnt::DirSnapshot(p, _)) => p.clone(),
                    _ => return rlerror(EACCES),
                };
                let snapshot = store.children(&path);
                // Entries marked as vanishing disappear the moment they
                // have been enumerated.
                let vanished: Vec<String> = snapshot
                    .iter()
                    .map(|(name, _)| join_path(&path, name))
                    .filter(|p| store.vanish.contains(p))
                    .collect();
                for p in vanished {
                    store.remove_subtree(&p);
                }
                fids.insert(fid, FidEnt::DirSnapshot(path, snapshot));
            }
            let entries = match fids.get(&fid) {
                Some(FidEnt::DirSnapshot(_, entries)) => entries,
                _ => return rlerror(EACCES),
            };
            let mut data = DirEntryData::new();
            for (i, (name, qid)) in entries.iter().enumerate().skip(offset as usize) {
                data.push(DirEntry {
                    qid: *qid,
                    offset: i as u64 + 1,
                    typ: 0,
                    name: name.clone(),
                });
            }
            FCall::RReadDir { data }
        }
        FCall::TRemove { fid } => {
            // The fid is clunked whether or not the remove succeeds.
            let ent = fids.remove(&fid);
            let path = match ent {
                Some(FidEnt::Path(p)) | Some(FidEnt::DirSnapshot(p, _)) => p,
                _ => return rlerror(EACCES),
            };
            if store.deny_remove.contains(&path) {
                return rlerror(EACCES);
            }
            if !store.nodes.contains_key(&path) || store.vanish.contains(&path) {
                return rlerror(ENOENT);
            }
            if !store.children(&path).is_empty() {
                return rlerror(ENOTEMPTY);
            }
            store.nodes.remove(&path);
            FCall::RRemove
        }
        FCall::TClunk { fid } => {
            match fids.remove(&fid) {
                Some(FidEnt::XattrWrite(path, name, size, buf)) => {
                    // Zero promised size is a delete; otherwise the clunk
                    // commits the buffered value.
                    if let Some(node) = store.nodes.get_mut(&path) {
                        if size == 0 {
                            node.xattrs.remove(&name);
                        } else {
                            node.xattrs.insert(name, buf);
                        }
                    }
                    FCall::RClunk
                }
                Some(_) => FCall::RClunk,
                None => rlerror(EACCES),
            }
        }
        other => {
            panic!("mock server got unexpected message: {:?}", other);
        }
    }
}

// `Msg` carries type+tag+body; the size[4] prefix (which counts itself)
// belongs to the framing layer, so the mock adds and strips it here.
fn encode(msg: &Msg) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    write_msg(&mut buf, msg).unwrap();
    let payload = buf.into_inner();
    let mut frame = ((payload.len() + 4) as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(&payload);
    frame
}

async fn serve(mut io: tokio::io::DuplexStream, store: Arc<Mutex<Store>>, opts: MockOptions) {
    let mut fids: HashMap<u32, FidEnt> = HashMap::new();
    let mut held: Option<Vec<u8>> = None;

    loop {
        let mut sizebuf = [0u8; 4];
        if io.read_exact(&mut sizebuf).await.is_err() {
            break;
        }
        let size = u32::from_le_bytes(sizebuf) as usize;
        let mut rest = vec![0u8; size - 4];
        if io.read_exact(&mut rest).await.is_err() {
            break;
        }
        let msg = read_msg(&mut Cursor::new(rest)).unwrap();

        let die = opts.die_after_attach && matches!(msg.body, FCall::TAttach { .. });

        let reply = handle(&store, &mut fids, &opts, msg.body);
        let is_getattr = matches!(reply, FCall::RGetAttr { .. });
        let frame = encode(&Msg {
            tag: msg.tag,
            body: reply,
        });

        if is_getattr {
            if let Some(delay) = opts.delay_getattr {
                tokio::time::sleep(delay).await;
            }
        }

        if opts.reorder_getattr && is_getattr && held.is_none() {
            held = Some(frame);
        } else {
            io.write_all(&frame).await.unwrap();
            if let Some(late) = held.take() {
                io.write_all(&late).await.unwrap();
            }
        }

        if die {
            break;
        }
    }
}

async fn start(opts: MockOptions) -> (Session, Arc<Mutex<Store>>) {
    let store = Arc::new(Mutex::new(Store::new()));
    let session = start_with(opts, store.clone(), SessionOptions::default())
        .await
        .unwrap();
    (session, store)
}

async fn start_with(
    opts: MockOptions,
    store: Arc<Mutex<Store>>,
    session_opts: SessionOptions,
) -> c9p::Result<Session> {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    tokio::spawn(serve(server_io, store, opts));

    let (reader, writer) = tokio::io::split(client_io);
    Session::handshake(reader, writer, session_opts).await
}

fn perms() -> Mode {
    Mode::from_bits(0o644).unwrap()
}

fn dir_perms() -> Mode {
    Mode::from_bits(0o755).unwrap()
}

async fn mkfile(session: &Session, path: &str) {
    let mut fid = session
        .open(path, OpenFlags::RDWR | OpenFlags::CREATE, perms())
        .await
        .unwrap();
    fid.clunk().await.unwrap();
}

#[tokio::test]
async fn handshake_negotiates_version_and_msize() {
    let (mut session, _store) = start(MockOptions::default()).await;
    assert_eq!(session.version(), P92000L);
    assert_eq!(session.msize(), 64 * 1024);
    assert!(session.root_qid().is_dir());
    session.close().await.unwrap();
}

#[tokio::test]
async fn incompatible_version_is_refused() {
    let store = Arc::new(Mutex::new(Store::new()));
    let err = start_with(
        MockOptions {
            version: "9P2000".to_owned(),
            ..Default::default()
        },
        store,
        SessionOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::IncompatibleVersion(v) if v == "9P2000"));
}

#[tokio::test]
async fn chown_chmod_round_trip() {
    let (mut session, _store) = start(MockOptions::default()).await;

    session.mkdir("work", dir_perms()).await.unwrap();
    mkfile(&session, "work/data.bin").await;

    let mut fid = session.walk("work/data.bin").await.unwrap();
    fid.chown(1000, 100).await.unwrap();
    fid.chmod(Mode::from_bits(0o246).unwrap()).await.unwrap();
    fid.clunk().await.unwrap();

    let stat = session.stat("work/data.bin").await.unwrap();
    assert_eq!(stat.uid, 1000);
    assert_eq!(stat.gid, 100);
    assert_eq!(stat.mode & 0o7777, 0o246);

    session.close().await.unwrap();
}

#[tokio::test]
async fn xattr_lifecycle() {
    let (mut session, _store) = start(MockOptions::default()).await;
    mkfile(&session, "tagged.txt").await;

    let mut fid = session.walk("tagged.txt").await.unwrap();

    let wrote = fid.xattrset("security.foo", b"foobar").await.unwrap();
    assert_eq!(wrote, 6);

    let names = fid.xattrlist(4096).await.unwrap();
    assert_eq!(names, vec!["security.foo"]);

    let value = fid.xattrget("security.foo", 4096).await.unwrap();
    assert_eq!(value, b"foobar");

    // max_size caps the value read.
    let partial = fid.xattrget("security.foo", 3).await.unwrap();
    assert_eq!(partial, b"foo");

    // A zero-length value removes the attribute.
    fid.xattrset("security.foo", b"").await.unwrap();
    let names = fid.xattrlist(4096).await.unwrap();
    assert!(names.is_empty());

    fid.clunk().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn walk_incomplete_reports_progress() {
    let (mut session, _store) = start(MockOptions::default()).await;
    session.mkdir("a", dir_perms()).await.unwrap();

    let err = session.walk("a/missing/c").await.unwrap_err();
    assert!(matches!(
        err,
        Error::WalkIncomplete {
            resolved: 1,
            requested: 3
        }
    ));
    assert!(err.is_not_found());

    session.close().await.unwrap();
}

#[tokio::test]
async fn rm_missing_is_not_found() {
    let (mut session, _store) = start(MockOptions::default()).await;
    let err = session.rm("never-existed").await.unwrap_err();
    assert!(err.is_not_found());
    session.close().await.unwrap();
}

#[tokio::test]
async fn rmrf_removes_whole_tree() {
    let (mut session, store) = start(MockOptions::default()).await;

    session.mkdir("big", dir_perms()).await.unwrap();
    for d in 0..3 {
        let dir = format!("big/d{}", d);
        session.mkdir(&dir, dir_perms()).await.unwrap();
        session
            .mkdir(&format!("{}/nested", dir), dir_perms())
            .await
            .unwrap();
        for f in 0..4 {
            mkfile(&session, &format!("{}/f{}", dir, f)).await;
            mkfile(&session, &format!("{}/nested/g{}", dir, f)).await;
        }
    }

    session.rmrf("big").await.unwrap();

    let store = store.lock().unwrap();
    assert!(!store.nodes.contains_key("big"));
    assert!(!store.nodes.keys().any(|p| p.starts_with("big/")));
    drop(store);

    session.close().await.unwrap();
}

#[tokio::test]
async fn rmrf_tolerates_entries_vanishing_after_enumeration() {
    let (mut session, store) = start(MockOptions::default()).await;

    session.mkdir("del", dir_perms()).await.unwrap();
    mkfile(&session, "del/ghost.txt").await;
    mkfile(&session, "del/real.txt").await;
    store
        .lock()
        .unwrap()
        .vanish
        .insert("del/ghost.txt".to_owned());

    session.rmrf("del").await.unwrap();
    assert!(!store.lock().unwrap().nodes.contains_key("del"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn rmrf_contains_partial_failure() {
    let (mut session, store) = start(MockOptions::default()).await;

    session.mkdir("work", dir_perms()).await.unwrap();
    session.mkdir("work/sub", dir_perms()).await.unwrap();
    mkfile(&session, "work/keep.txt").await;
    mkfile(&session, "work/sub/a").await;
    mkfile(&session, "work/sub/b").await;
    store
        .lock()
        .unwrap()
        .deny_remove
        .insert("work/keep.txt".to_owned());

    let err = session.rmrf("work").await.unwrap_err();
    assert!(err.first.is_permission_denied());
    // The undeletable file plus the directory above it.
    assert_eq!(err.remaining, 2);

    // Siblings were still removed; no ancestor of the failure was touched.
    let store = store.lock().unwrap();
    assert!(store.nodes.contains_key("work"));
    assert!(store.nodes.contains_key("work/keep.txt"));
    assert!(!store.nodes.contains_key("work/sub"));
    assert!(!store.nodes.contains_key("work/sub/a"));
    drop(store);

    session.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_transactions_survive_reordered_replies() {
    let (mut session, _store) = start(MockOptions {
        reorder_getattr: true,
        ..Default::default()
    })
    .await;

    mkfile(&session, "one").await;
    mkfile(&session, "two").await;
    {
        let mut fid = session.walk("one").await.unwrap();
        fid.chown(1, 1).await.unwrap();
        fid.clunk().await.unwrap();
    }
    {
        let mut fid = session.walk("two").await.unwrap();
        fid.chown(2, 2).await.unwrap();
        fid.clunk().await.unwrap();
    }

    let (one, two) = tokio::join!(session.stat("one"), session.stat("two"));
    assert_eq!(one.unwrap().uid, 1);
    assert_eq!(two.unwrap().uid, 2);

    session.close().await.unwrap();
}

#[tokio::test]
async fn transport_loss_fails_pending_and_future_transactions() {
    let (session, _store) = start(MockOptions {
        die_after_attach: true,
        ..Default::default()
    })
    .await;

    // Give the dispatcher time to observe the EOF.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = session.stat("anything").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn exclusive_create_surfaces_existing_name() {
    let (mut session, _store) = start(MockOptions::default()).await;
    mkfile(&session, "taken").await;

    let err = session
        .open(
            "taken",
            OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::EXCL,
            perms(),
        )
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    // Without EXCL the existing file is opened instead of recreated.
    let mut fid = session
        .open("taken", OpenFlags::RDWR | OpenFlags::CREATE, perms())
        .await
        .unwrap();
    fid.clunk().await.unwrap();

    session.close().await.unwrap();
}

#[tokio::test]
async fn timed_out_tag_is_reserved_until_the_late_reply() {
    use std::time::Duration;

    let store = Arc::new(Mutex::new(Store::new()));
    let mut session = start_with(
        MockOptions {
            delay_getattr: Some(Duration::from_millis(300)),
            ..Default::default()
        },
        store,
        SessionOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    mkfile(&session, "slow").await;

    let err = session.stat("slow").await.unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // Once the late reply has been discarded, later transactions still
    // correlate correctly over recycled tags.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut fid = session.walk("slow").await.unwrap();
    fid.chown(7, 7).await.unwrap();
    fid.clunk().await.unwrap();

    session.close().await.unwrap();
}

#[tokio::test]
async fn clunk_is_terminal() {
    let (mut session, _store) = start(MockOptions::default()).await;
    mkfile(&session, "f").await;

    let mut fid = session.walk("f").await.unwrap();
    fid.clunk().await.unwrap();

    assert!(matches!(fid.clunk().await.unwrap_err(), Error::HandleClosed));
    assert!(matches!(fid.stat().await.unwrap_err(), Error::HandleClosed));

    session.close().await.unwrap();
}
