//! PeerName — an immutable `(name, owning-peer)` node inserted into exactly
//! one of a peer's private name list or the domain's ordered name index
//! (spec §3/§4.2).

use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::peer::Peer;

pub struct PeerName {
    pub name: Box<[u8]>,
    /// Weak: a name is lookup-only and must never extend the peer's
    /// lifetime (spec's cycle-avoidance design note).
    peer: Weak<Peer>,
}

impl PeerName {
    /// Rejects names shorter than 1 byte or longer than `name_max`.
    pub fn new(name: &[u8], peer: &Arc<Peer>, name_max: usize) -> Result<Arc<Self>> {
        if name.is_empty() || name.len() > name_max {
            return Err(Error::InvalidArg);
        }
        Ok(Arc::new(Self {
            name: name.to_vec().into_boxed_slice(),
            peer: Arc::downgrade(peer),
        }))
    }

    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.upgrade()
    }

    /// Parses a trailing name blob of zero-terminated strings (spec §4.5),
    /// rejecting any entry that is empty or not fully nul-terminated.
    pub fn parse_blob(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut start = 0usize;
        for (i, &b) in blob.iter().enumerate() {
            if b == 0 {
                if i == start {
                    return Err(Error::InvalidArg);
                }
                names.push(blob[start..i].to_vec());
                start = i + 1;
            }
        }
        if start != blob.len() {
            // trailing bytes with no terminator: not "fully contained"
            return Err(Error::InvalidArg);
        }
        Ok(names)
    }

    /// Exact-set comparison used to distinguish `AlreadyConnected` from
    /// `RemoteChanged` on a reconnect (spec §4.5, `SPEC_FULL.md` §B.2):
    /// the caller's blob must name precisely the peer's existing names,
    /// same count, order-insensitive.
    pub fn names_match(existing: &[Arc<PeerName>], blob: &[u8]) -> Result<bool> {
        let parsed = Self::parse_blob(blob)?;
        if parsed.len() != existing.len() {
            return Ok(false);
        }
        let mut existing_sorted: Vec<&[u8]> = existing.iter().map(|n| &*n.name).collect();
        existing_sorted.sort_unstable();
        let mut parsed_sorted: Vec<&[u8]> = parsed.iter().map(|n| n.as_slice()).collect();
        parsed_sorted.sort_unstable();
        Ok(existing_sorted == parsed_sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blob_splits_on_nul() {
        let names = PeerName::parse_blob(b"alpha\0beta\0").unwrap();
        assert_eq!(names, vec![b"alpha".to_vec(), b"beta".to_vec()]);
    }

    #[test]
    fn parse_blob_rejects_empty_entry() {
        assert_eq!(
            PeerName::parse_blob(b"\0alpha\0").unwrap_err(),
            Error::InvalidArg
        );
    }

    #[test]
    fn parse_blob_rejects_missing_terminator() {
        assert_eq!(
            PeerName::parse_blob(b"alpha\0beta").unwrap_err(),
            Error::InvalidArg
        );
    }

    #[test]
    fn parse_blob_empty_is_empty_list() {
        assert_eq!(PeerName::parse_blob(b"").unwrap(), Vec::<Vec<u8>>::new());
    }
}
