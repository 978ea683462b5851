//! Handle on the local chain: genesis plus the current committed block.

use parking_lot::RwLock;
use shared_types::{Body, Hash, Header};

#[derive(Debug, Clone)]
struct ChainState {
    current_header: Option<Header>,
    current_hash: Option<Hash>,
    current_body: Option<Body>,
}

#[derive(Debug)]
pub struct BlockChain {
    genesis_header: Header,
    genesis_hash: Hash,
    state: RwLock<ChainState>,
}

impl BlockChain {
    pub fn new(genesis_header: Header, genesis_hash: Hash) -> Self {
        Self {
            genesis_header,
            genesis_hash,
            state: RwLock::new(ChainState {
                current_header: None,
                current_hash: None,
                current_body: None,
            }),
        }
    }

    pub fn genesis_header(&self) -> &Header {
        &self.genesis_header
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Last committed header; `None` right after genesis.
    pub fn current_header(&self) -> Option<Header> {
        self.state.read().current_header.clone()
    }

    pub fn current_header_hash(&self) -> Option<Hash> {
        self.state.read().current_hash
    }

    pub fn current_body(&self) -> Option<Body> {
        self.state.read().current_body.clone()
    }

    /// Current header, or genesis when nothing was committed yet.
    pub fn current_or_genesis(&self) -> (Header, Hash) {
        let state = self.state.read();
        match (&state.current_header, state.current_hash) {
            (Some(header), Some(hash)) => (header.clone(), hash),
            _ => (self.genesis_header.clone(), self.genesis_hash),
        }
    }

    /// Replaces the current block in one step.
    pub fn set_current(&self, header: Header, hash: Hash, body: Body) {
        let mut state = self.state.write();
        state.current_header = Some(header);
        state.current_hash = Some(hash);
        state.current_body = Some(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::ShardHeader;

    #[test]
    fn test_falls_back_to_genesis() {
        let genesis = Header::Shard(ShardHeader::default());
        let chain = BlockChain::new(genesis.clone(), [9; 32]);
        assert!(chain.current_header().is_none());
        assert_eq!(chain.current_or_genesis(), (genesis, [9; 32]));

        let next = Header::Shard(ShardHeader {
            nonce: 1,
            ..Default::default()
        });
        chain.set_current(next.clone(), [1; 32], Body::default());
        assert_eq!(chain.current_or_genesis(), (next, [1; 32]));
        assert_eq!(chain.current_body(), Some(Body::default()));
    }
}
