use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::identity::PeerAddress;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EnvelopeVersion {
    V1 = 1,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(from: PeerAddress, to: PeerAddress, payload: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&from.0);
        digest.update(&to.0);
        digest.update(payload);

        Checksum(digest.finalize())
    }
}


/// The framing every datagram carries on the shared transport, so that the receiving node can
///  demultiplex it to the sender's channel:
///
/// ```ascii
/// 0: version (u8)
/// 1: sender address (32 bytes)
/// 33: recipient address (32 bytes)
/// 65: CRC-64 over sender, recipient and payload (u64)
/// 73: payload
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub version: EnvelopeVersion,
    pub from: PeerAddress,
    pub to: PeerAddress,
    pub checksum: Checksum,
}
impl Envelope {
    pub const SERIALIZED_LEN: usize = 1 + 2*PeerAddress::SERIALIZED_LEN + size_of::<u64>();

    pub fn wrap(from: PeerAddress, to: PeerAddress, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN + payload.len());
        Self::write(from, to, Checksum::new(from, to, payload), &mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn write(from: PeerAddress, to: PeerAddress, checksum: Checksum, buf: &mut impl BufMut) {
        buf.put_u8(EnvelopeVersion::V1.into());
        from.ser(buf);
        to.ser(buf);
        buf.put_u64(checksum.0);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("datagram too short for an envelope: {} bytes", buf.remaining());
        }

        let version = buf.get_u8();
        let version = EnvelopeVersion::try_from(version)
            .map_err(|_| anyhow!("unsupported envelope version {}", version))?;
        let from = PeerAddress::try_deser(buf)?;
        let to = PeerAddress::try_deser(buf)?;
        let checksum = Checksum(buf.get_u64());

        Ok(Envelope {
            version,
            from,
            to,
            checksum,
        })
    }

    pub fn is_valid_for(&self, payload: &[u8]) -> bool {
        self.checksum == Checksum::new(self.from, self.to, payload)
    }
}
