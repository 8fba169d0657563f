use crate::identity::{Identity, PeerAddress};

pub fn test_peer_address_from_number(number: u16) -> PeerAddress {
    test_identity(number).address()
}

/// deterministic identities so that test failures are reproducible
pub fn test_identity(number: u16) -> Identity {
    let mut secret_key = [0u8; 32];
    secret_key[..2].copy_from_slice(&number.to_be_bytes());
    Identity::from_secret_key(secret_key)
}
