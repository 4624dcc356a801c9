//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Time {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.sec << &self.nsec {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.nlink
            << &self.rdev
            << &self.size
            << &self.blksize
            << &self.blocks
            << &self.atime
            << &self.mtime
            << &self.ctime
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for SetAttr {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.qid << &self.offset << &self.typ << &self.name {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for DirEntryData {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .data()
            .iter()
            .fold(Encoder::new(w) << &self.size(), |acc, e| acc << e)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            // 9P2000.L
            RlError { ref ecode } => buf << ecode,
            TlOpen { ref fid, ref flags } => buf << fid << flags,
            RlOpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TlCreate {
                ref fid,
                ref name,
                ref flags,
                ref mode,
                ref gid,
            } => buf << fid << name << flags << mode << gid,
            RlCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TGetAttr {
                ref fid,
                ref req_mask,
            } => buf << fid << &req_mask.bits(),
            RGetAttr {
                ref valid,
                ref qid,
                ref stat,
            } => buf << &valid.bits() << qid << stat << &0u64 << &0u64 << &0u64 << &0u64,
            TSetAttr {
                ref fid,
                ref valid,
                ref stat,
            } => buf << fid << &valid.bits() << stat,
            RSetAttr => buf,
            TxAttrWalk {
                ref fid,
                ref newfid,
                ref name,
            } => buf << fid << newfid << name,
            RxAttrWalk { ref size } => buf << size,
            TxAttrCreate {
                ref fid,
                ref name,
                ref attr_size,
                ref flags,
            } => buf << fid << name << attr_size << flags,
            RxAttrCreate => buf,
            TReadDir {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RReadDir { ref data } => buf << data,
            TMkDir {
                ref dfid,
                ref name,
                ref mode,
                ref gid,
            } => buf << dfid << name << mode << gid,
            RMkDir { ref qid } => buf << qid,

            /*
             * 9P2000.u
             */
            TAuth {
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => buf << afid << uname << aname << n_uname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => buf << fid << afid << uname << aname << n_uname,
            RAttach { ref qid } => buf << qid,

            /*
             * 9P2000
             */
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Time {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Time {
            sec: Decodable::decode(r)?,
            nsec: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Stat {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            nlink: Decodable::decode(r)?,
            rdev: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            blksize: Decodable::decode(r)?,
            blocks: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
        })
    }
}

impl Decodable for SetAttr {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(SetAttr {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirEntry {
            qid: Decodable::decode(r)?,
            offset: Decodable::decode(r)?,
            typ: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntryData {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let count: u32 = Decodable::decode(r)?;
        let mut bytes = 0;
        let mut data: Vec<DirEntry> = Vec::new();
        while bytes < count {
            let entry: DirEntry = Decodable::decode(r)?;
            bytes += entry.size();
            data.push(entry);
        }
        Ok(DirEntryData::with(data))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            /*
             * 9P2000.L
             */
            Some(RlError) => FCall::RlError {
                ecode: decode!(buf),
            },
            Some(TlOpen) => FCall::TlOpen {
                fid: decode!(buf),
                flags: decode!(buf),
            },
            Some(RlOpen) => FCall::RlOpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TlCreate) => FCall::TlCreate {
                fid: decode!(buf),
                name: decode!(buf),
                flags: decode!(buf),
                mode: decode!(buf),
                gid: decode!(buf),
            },
            Some(RlCreate) => FCall::RlCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TGetAttr) => FCall::TGetAttr {
                fid: decode!(buf),
                req_mask: decode!(GetAttrMask, buf),
            },
            Some(RGetAttr) => {
                let r = FCall::RGetAttr {
                    valid: decode!(GetAttrMask, buf),
                    qid: decode!(buf),
                    stat: decode!(buf),
                };
                let (_btime, _gen, _ver): (Time, u64, u64) =
                    (decode!(buf), decode!(buf), decode!(buf));
                r
            }
            Some(TSetAttr) => FCall::TSetAttr {
                fid: decode!(buf),
                valid: decode!(SetAttrMask, buf),
                stat: decode!(buf),
            },
            Some(RSetAttr) => FCall::RSetAttr,
            Some(TxAttrWalk) => FCall::TxAttrWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                name: decode!(buf),
            },
            Some(RxAttrWalk) => FCall::RxAttrWalk { size: decode!(buf) },
            Some(TxAttrCreate) => FCall::TxAttrCreate {
                fid: decode!(buf),
                name: decode!(buf),
                attr_size: decode!(buf),
                flags: decode!(buf),
            },
            Some(RxAttrCreate) => FCall::RxAttrCreate,
            Some(TReadDir) => FCall::TReadDir {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RReadDir) => FCall::RReadDir { data: decode!(buf) },
            Some(TMkDir) => FCall::TMkDir {
                dfid: decode!(buf),
                name: decode!(buf),
                mode: decode!(buf),
                gid: decode!(buf),
            },
            Some(RMkDir) => FCall::RMkDir { qid: decode!(buf) },

            /*
             * 9P2000.u
             */
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
                n_uname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
                n_uname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },

            /*
             * 9P2000
             */
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            None => return Err(io_err!(Other, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn assert_round_trip(msg: Msg) {
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();

        assert_eq!(msg, actual);
    }

    fn some_qid() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 13,
            path: 0x0123_4567_89ab_cdef,
        }
    }

    fn some_stat() -> Stat {
        Stat {
            mode: 0o100644,
            uid: 1000,
            gid: 100,
            nlink: 2,
            rdev: 0,
            size: 4096,
            blksize: 4096,
            blocks: 8,
            atime: Time { sec: 1, nsec: 2 },
            mtime: Time { sec: 3, nsec: 4 },
            ctime: Time { sec: 5, nsec: 6 },
        }
    }

    #[test]
    fn version_round_trip() {
        assert_round_trip(Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: DEFAULT_MSIZE,
                version: P92000L.to_owned(),
            },
        });
        assert_round_trip(Msg {
            tag: NOTAG,
            body: FCall::RVersion {
                msize: 8192,
                version: VERSION_UNKNOWN.to_owned(),
            },
        });
    }

    #[test]
    fn attach_round_trip() {
        assert_round_trip(Msg {
            tag: 1,
            body: FCall::TAuth {
                afid: 1,
                uname: "nobody".to_owned(),
                aname: "/".to_owned(),
                n_uname: NONUNAME,
            },
        });
        assert_round_trip(Msg {
            tag: 1,
            body: FCall::RAuth { aqid: some_qid() },
        });
        assert_round_trip(Msg {
            tag: 1,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "root".to_owned(),
                aname: "/export".to_owned(),
                n_uname: 0,
            },
        });
        assert_round_trip(Msg {
            tag: 1,
            body: FCall::RAttach { qid: some_qid() },
        });
    }

    #[test]
    fn walk_round_trip() {
        assert_round_trip(Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
            },
        });
        assert_round_trip(Msg {
            tag: 2,
            body: FCall::RWalk {
                wqids: vec![some_qid(); 3],
            },
        });
        // zero-component walk clones a fid
        assert_round_trip(Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: Vec::new(),
            },
        });
        assert_round_trip(Msg {
            tag: 2,
            body: FCall::RWalk { wqids: Vec::new() },
        });
    }

    #[test]
    fn open_create_round_trip() {
        assert_round_trip(Msg {
            tag: 3,
            body: FCall::TlOpen {
                fid: 5,
                flags: (OpenFlags::RDWR | OpenFlags::TRUNC).bits(),
            },
        });
        assert_round_trip(Msg {
            tag: 3,
            body: FCall::RlOpen {
                qid: some_qid(),
                iounit: 0,
            },
        });
        assert_round_trip(Msg {
            tag: 3,
            body: FCall::TlCreate {
                fid: 5,
                name: "newfile".to_owned(),
                flags: (OpenFlags::RDWR | OpenFlags::CREATE).bits(),
                mode: 0o644,
                gid: 100,
            },
        });
        assert_round_trip(Msg {
            tag: 3,
            body: FCall::RlCreate {
                qid: some_qid(),
                iounit: 8192,
            },
        });
    }

    #[test]
    fn getattr_round_trip() {
        assert_round_trip(Msg {
            tag: 4,
            body: FCall::TGetAttr {
                fid: 7,
                req_mask: GetAttrMask::BASIC,
            },
        });
        assert_round_trip(Msg {
            tag: 4,
            body: FCall::RGetAttr {
                valid: GetAttrMask::BASIC,
                qid: some_qid(),
                stat: some_stat(),
            },
        });
    }

    #[test]
    fn setattr_round_trip() {
        assert_round_trip(Msg {
            tag: 5,
            body: FCall::TSetAttr {
                fid: 7,
                valid: SetAttrMask::UID | SetAttrMask::GID,
                stat: SetAttr {
                    uid: 1000,
                    gid: 100,
                    ..Default::default()
                },
            },
        });
        assert_round_trip(Msg {
            tag: 5,
            body: FCall::RSetAttr,
        });
    }

    #[test]
    fn xattr_round_trip() {
        assert_round_trip(Msg {
            tag: 6,
            body: FCall::TxAttrWalk {
                fid: 7,
                newfid: 8,
                name: "security.foo".to_owned(),
            },
        });
        assert_round_trip(Msg {
            tag: 6,
            body: FCall::RxAttrWalk { size: 6 },
        });
        assert_round_trip(Msg {
            tag: 6,
            body: FCall::TxAttrCreate {
                fid: 8,
                name: "security.foo".to_owned(),
                attr_size: 0,
                flags: 0,
            },
        });
        assert_round_trip(Msg {
            tag: 6,
            body: FCall::RxAttrCreate,
        });
    }

    #[test]
    fn readdir_round_trip() {
        let mut data = DirEntryData::new();
        data.push(DirEntry {
            qid: some_qid(),
            offset: 1,
            typ: 0,
            name: "subdir".to_owned(),
        });
        data.push(DirEntry {
            qid: QId::default(),
            offset: 2,
            typ: 0,
            name: "file".to_owned(),
        });

        assert_round_trip(Msg {
            tag: 7,
            body: FCall::TReadDir {
                fid: 7,
                offset: 0,
                count: 8168,
            },
        });
        assert_round_trip(Msg {
            tag: 7,
            body: FCall::RReadDir { data },
        });
    }

    #[test]
    fn mkdir_round_trip() {
        assert_round_trip(Msg {
            tag: 8,
            body: FCall::TMkDir {
                dfid: 0,
                name: "dir".to_owned(),
                mode: 0o755,
                gid: 0,
            },
        });
        assert_round_trip(Msg {
            tag: 8,
            body: FCall::RMkDir { qid: some_qid() },
        });
    }

    #[test]
    fn io_round_trip() {
        assert_round_trip(Msg {
            tag: 9,
            body: FCall::TRead {
                fid: 9,
                offset: 1024,
                count: 4096,
            },
        });
        assert_round_trip(Msg {
            tag: 9,
            body: FCall::RRead {
                data: Data(b"foobar".to_vec()),
            },
        });
        assert_round_trip(Msg {
            tag: 9,
            body: FCall::TWrite {
                fid: 9,
                offset: 0,
                data: Data(vec![0u8; 128]),
            },
        });
        assert_round_trip(Msg {
            tag: 9,
            body: FCall::RWrite { count: 128 },
        });
    }

    #[test]
    fn clunk_remove_round_trip() {
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::TClunk { fid: 11 },
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::RClunk,
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::TRemove { fid: 11 },
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::RRemove,
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::TFlush { oldtag: 9 },
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::RFlush,
        });
        assert_round_trip(Msg {
            tag: 10,
            body: FCall::RlError { ecode: 2 },
        });
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        // type 6 (Tlerror) is illegal and not part of the message set
        let mut readbuf = Cursor::new(vec![6u8, 0, 0, 0, 0]);
        let res: Result<Msg> = Decodable::decode(&mut readbuf);
        assert!(res.is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let msg = Msg {
            tag: 1,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["name".to_owned()],
            },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        let mut readbuf = Cursor::new(buf);
        let res: Result<Msg> = Decodable::decode(&mut readbuf);
        assert!(res.is_err());
    }
}
