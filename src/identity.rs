use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

/// The stable key identifying a node in the overlay. Channels, the peer table and the
///  intra-process registry are all keyed by this address, never by a transport address.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerAddress(pub [u8; PeerAddress::SERIALIZED_LEN]);

impl PeerAddress {
    pub const SERIALIZED_LEN: usize = 32;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddress> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer too short for a peer address: {} bytes", buf.remaining());
        }
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(PeerAddress(raw))
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // first four bytes are plenty to tell peers apart in logs
        write!(f, "[")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..]")
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * Self::SERIALIZED_LEN || !s.is_ascii() {
            bail!("a peer address has {} hex digits, was {:?}", 2 * Self::SERIALIZED_LEN, s);
        }

        let mut raw = [0u8; Self::SERIALIZED_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2*i..2*i + 2], 16)
                .map_err(|e| anyhow!("invalid hex digit in peer address {:?}: {}", s, e))?;
        }
        Ok(PeerAddress(raw))
    }
}


/// A node's credential: a secret key and the [PeerAddress] derived from it.
///
/// NB: The derivation is a plain SHA-256 hash. It gives stable, well-distributed addresses but
///      makes no cryptographic claims - authenticating peers is the handshake layer's business.
#[derive(Clone)]
pub struct Identity {
    address: PeerAddress,
    secret_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Identity {
        Self::from_secret_key(rand::random())
    }

    pub fn from_secret_key(secret_key: [u8; 32]) -> Identity {
        let digest = Sha256::digest(secret_key);
        let mut address = [0u8; PeerAddress::SERIALIZED_LEN];
        address.copy_from_slice(&digest);

        Identity {
            address: PeerAddress(address),
            secret_key,
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({:?})", self.address)
    }
}
