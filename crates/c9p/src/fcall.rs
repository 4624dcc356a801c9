//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000.L

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000.L version string
pub const P92000L: &str = "9P2000.L";

/// The version string that comes with `RVersion` when the server does not
/// understand the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message
/// should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `TAuth`/`TAttach` use as `n_uname` to indicate no uid is specified
pub const NONUNAME: u32 = !0;

/// Maximum number of path components in a single `TWalk`
pub const MAXWELEM: usize = 16;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Room for readdir header
pub const READDIRHDRSZ: u32 = 24;

/// Default maximum message size proposed in `TVersion`
pub const DEFAULT_MSIZE: u32 = 64 * 1024;

/// Default port of diod and other 9P2000.L servers
pub const DEFAULT_PORT: u16 = 5640;

bitflags! {
    /// Bits in QId.typ
    ///
    /// # Protocol
    /// 9P2000/9P2000.L
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

bitflags! {
    /// Open flags carried by `TlOpen` and `TlCreate`.
    ///
    /// 9P2000.L transmits the Linux `O_*` numeric values on the wire.
    /// Constructing the flags through this type keeps unknown bits out of
    /// requests; servers are known to misbehave when handed flags they do
    /// not expect.
    ///
    /// # Protocol
    /// 9P2000.L
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct OpenFlags: u32 {
        const RDONLY    = 0o0;
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const CREATE    = 0o100;
        const EXCL      = 0o200;
        const TRUNC     = 0o1000;
        const APPEND    = 0o2000;
        const DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    /// Whether the flags ask for write access
    pub fn is_write(&self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

bitflags! {
    /// POSIX permission bits for `chmod`, `TlCreate` and `TMkDir`.
    ///
    /// `Mode::from_bits` is the validation point for loosely-typed integers
    /// coming from callers; bits outside 0o7777 are rejected.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct Mode: u32 {
        const SETUID = 0o4000;
        const SETGID = 0o2000;
        const STICKY = 0o1000;
        const OWNER_READ  = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC  = 0o100;
        const GROUP_READ  = 0o40;
        const GROUP_WRITE = 0o20;
        const GROUP_EXEC  = 0o10;
        const OTHER_READ  = 0o4;
        const OTHER_WRITE = 0o2;
        const OTHER_EXEC  = 0o1;
    }
}

bitflags! {
    /// Bits in `mask` and `valid` of `TGetAttr` and `RGetAttr`.
    ///
    /// # Protocol
    /// 9P2000.L
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct GetAttrMask: u64 {
        const MODE          = 0x00000001;
        const NLINK         = 0x00000002;
        const UID           = 0x00000004;
        const GID           = 0x00000008;
        const RDEV          = 0x00000010;
        const ATIME         = 0x00000020;
        const MTIME         = 0x00000040;
        const CTIME         = 0x00000080;
        const INO           = 0x00000100;
        const SIZE          = 0x00000200;
        const BLOCKS        = 0x00000400;

        const BTIME         = 0x00000800;
        const GEN           = 0x00001000;
        const DATA_VERSION  = 0x00002000;

        #[doc = "Mask for fields up to BLOCKS"]
        const BASIC         =0x000007ff;
        #[doc = "Mask for All fields above"]
        const ALL           = 0x00003fff;
    }
}

bitflags! {
    /// Bits in `mask` of `TSetAttr`.
    ///
    /// A field of `SetAttr` whose bit is not set here is left untouched by
    /// the server; the unset bit is the "don't change" sentinel.
    ///
    /// # Protocol
    /// 9P2000.L
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SetAttrMask: u32 {
        const MODE      = 0x00000001;
        const UID       = 0x00000002;
        const GID       = 0x00000004;
        const SIZE      = 0x00000008;
        const ATIME     = 0x00000010;
        const MTIME     = 0x00000020;
        const CTIME     = 0x00000040;
        const ATIME_SET = 0x00000080;
        const MTIME_SET = 0x00000100;
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed. A changed
/// qid under an unchanged name means a different object now occupies that
/// name.
///
/// # Protocol
/// 9P2000/9P2000.L
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    pub fn size(&self) -> u32 {
        (size_of::<QIdType>() + size_of::<u32>() + size_of::<u64>()) as u32
    }

    /// Whether the qid names a directory
    pub fn is_dir(&self) -> bool {
        self.typ.contains(QIdType::DIR)
    }
}

/// Time struct
///
/// # Protocol
/// 9P2000.L
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

/// File attributes corresponding to `struct stat` of Linux.
///
/// Returned by `RGetAttr`; which fields are meaningful is stated by the
/// accompanying `valid` mask.
///
/// # Protocol
/// 9P2000.L
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Protection
    pub mode: u32,
    /// User ID of owner
    pub uid: u32,
    /// Group ID of owner
    pub gid: u32,
    /// Number of hard links
    pub nlink: u64,
    /// Device ID (if special file)
    pub rdev: u64,
    /// Total size, in bytes
    pub size: u64,
    /// Blocksize for file system I/O
    pub blksize: u64,
    /// Number of 512B blocks allocated
    pub blocks: u64,
    /// Time of last access
    pub atime: Time,
    /// Time of last modification
    pub mtime: Time,
    /// Time of last status change
    pub ctime: Time,
}

/// Subset of `Stat` used for `TSetAttr`
///
/// Fields not selected by the `SetAttrMask` are ignored by the server, so a
/// zeroed default with only the wanted fields filled in expresses a partial
/// update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// Directory entry used in `RReadDir`
///
/// # Protocol
/// 9P2000.L
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    /// QId for this directory
    pub qid: QId,
    /// The index of this entry
    pub offset: u64,
    /// Corresponds to `d_type` of `struct dirent`
    pub typ: u8,
    /// Directory name
    pub name: String,
}

impl DirEntry {
    pub fn size(&self) -> u32 {
        (self.qid.size() as usize
            + size_of_val(&self.offset)
            + size_of_val(&self.typ)
            + size_of::<u16>()
            + self.name.len()) as u32
    }
}

/// Directory entry array
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntryData {
    pub data: Vec<DirEntry>,
}

impl DirEntryData {
    pub fn new() -> DirEntryData {
        Self::with(Vec::new())
    }

    pub fn with(v: Vec<DirEntry>) -> DirEntryData {
        DirEntryData { data: v }
    }

    pub fn data(&self) -> &[DirEntry] {
        &self.data
    }

    pub fn size(&self) -> u32 {
        self.data.iter().fold(0, |a, e| a + e.size())
    }

    pub fn push(&mut self, entry: DirEntry) {
        self.data.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Data type used in `RRead` and `TWrite`
///
/// # Protocol
/// 9P2000/9P2000.L
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        // 9P2000.L
        RlError         = 7,
        TlOpen          = 12,
        RlOpen,
        TlCreate        = 14,
        RlCreate,
        TGetAttr        = 24,
        RGetAttr,
        TSetAttr        = 26,
        RSetAttr,
        TxAttrWalk      = 30,
        RxAttrWalk,
        TxAttrCreate    = 32,
        RxAttrCreate,
        TReadDir        = 40,
        RReadDir,
        TMkDir          = 72,
        RMkDir,

        // 9P2000[.u]
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            RlError
                | RlOpen
                | RlCreate
                | RGetAttr
                | RSetAttr
                | RxAttrWalk
                | RxAttrCreate
                | RReadDir
                | RMkDir
                | RVersion
                | RAuth
                | RAttach
                | RFlush
                | RWalk
                | RRead
                | RWrite
                | RClunk
                | RRemove
        )
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::RlError { .. } => MsgType::RlError,
            FCall::TlOpen { .. } => MsgType::TlOpen,
            FCall::RlOpen { .. } => MsgType::RlOpen,
            FCall::TlCreate { .. } => MsgType::TlCreate,
            FCall::RlCreate { .. } => MsgType::RlCreate,
            FCall::TGetAttr { .. } => MsgType::TGetAttr,
            FCall::RGetAttr { .. } => MsgType::RGetAttr,
            FCall::TSetAttr { .. } => MsgType::TSetAttr,
            FCall::RSetAttr => MsgType::RSetAttr,
            FCall::TxAttrWalk { .. } => MsgType::TxAttrWalk,
            FCall::RxAttrWalk { .. } => MsgType::RxAttrWalk,
            FCall::TxAttrCreate { .. } => MsgType::TxAttrCreate,
            FCall::RxAttrCreate => MsgType::RxAttrCreate,
            FCall::TReadDir { .. } => MsgType::TReadDir,
            FCall::RReadDir { .. } => MsgType::RReadDir,
            FCall::TMkDir { .. } => MsgType::TMkDir,
            FCall::RMkDir { .. } => MsgType::RMkDir,
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
        }
    }
}

/// A data type encapsulating the various 9P messages
///
/// Only the subset of 9P2000.L a client needs for attribute, extended
/// attribute, directory and removal work is represented here.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    // 9P2000.L
    RlError {
        ecode: u32,
    },
    TlOpen {
        fid: u32,
        flags: u32,
    },
    RlOpen {
        qid: QId,
        iounit: u32,
    },
    TlCreate {
        fid: u32,
        name: String,
        flags: u32,
        mode: u32,
        gid: u32,
    },
    RlCreate {
        qid: QId,
        iounit: u32,
    },
    TGetAttr {
        fid: u32,
        req_mask: GetAttrMask,
    },
    /// Reserved members specified in the protocol are handled in Encodable/Decodable traits.
    RGetAttr {
        valid: GetAttrMask,
        qid: QId,
        stat: Stat,
    },
    TSetAttr {
        fid: u32,
        valid: SetAttrMask,
        stat: SetAttr,
    },
    RSetAttr,
    TxAttrWalk {
        fid: u32,
        newfid: u32,
        name: String,
    },
    RxAttrWalk {
        size: u64,
    },
    TxAttrCreate {
        fid: u32,
        name: String,
        attr_size: u64,
        flags: u32,
    },
    RxAttrCreate,
    TReadDir {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RReadDir {
        data: DirEntryData,
    },
    TMkDir {
        dfid: u32,
        name: String,
        mode: u32,
        gid: u32,
    },
    RMkDir {
        qid: QId,
    },

    // 9P2000.u
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAttach {
        qid: QId,
    },

    // 9P2000
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}
