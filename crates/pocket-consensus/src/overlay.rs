// APPLICATION OVERLAY
// Post-connect hand-off of classified blocks to application observers.
//
// SAFETY INVARIANTS:
// 1. Observers run only after a block is durably connected or disconnected
// 2. Observers cannot veto; an observer error is logged and the chain
//    state is not rolled back
// 3. Dispatch is table driven: one handler list per TxKind

use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use pocket_core::{Block, Hash256, Transaction, TxKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observer {observer} failed: {reason}")]
pub struct ObserverError {
    pub observer: String,
    pub reason: String,
}

impl ObserverError {
    pub fn new(observer: impl Into<String>, reason: impl Into<String>) -> Self {
        ObserverError {
            observer: observer.into(),
            reason: reason.into(),
        }
    }
}

/// A connected or disconnected block with its transactions classified.
pub struct ClassifiedBlock<'a> {
    pub block: &'a Block,
    pub hash: Hash256,
    pub height: u32,
    pub kinds: Vec<TxKind>,
}

impl<'a> ClassifiedBlock<'a> {
    pub fn new(block: &'a Block, height: u32) -> Self {
        ClassifiedBlock {
            block,
            hash: block.hash(),
            height,
            kinds: block.transactions.iter().map(TxKind::classify).collect(),
        }
    }

    pub fn transactions(&self) -> impl Iterator<Item = (&'a Transaction, TxKind)> + '_ {
        self.block.transactions.iter().zip(self.kinds.iter().copied())
    }
}

/// Application component notified about chain movement.
pub trait BlockObserver: Send + Sync {
    fn name(&self) -> &str;

    fn block_connected(&self, block: &ClassifiedBlock<'_>) -> Result<(), ObserverError>;

    fn block_disconnected(&self, _block: &ClassifiedBlock<'_>) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Run every observer, logging failures.
pub fn notify_connected(observers: &[std::sync::Arc<dyn BlockObserver>], block: &ClassifiedBlock<'_>) {
    for observer in observers {
        if let Err(e) = observer.block_connected(block) {
            warn!("Observer {} failed on block {}: {}", observer.name(), block.hash, e);
        }
    }
}

pub fn notify_disconnected(observers: &[std::sync::Arc<dyn BlockObserver>], block: &ClassifiedBlock<'_>) {
    for observer in observers {
        if let Err(e) = observer.block_disconnected(block) {
            warn!("Observer {} failed undoing block {}: {}", observer.name(), block.hash, e);
        }
    }
}

pub type TxHandler = Box<dyn Fn(&Transaction, u32) -> Result<(), ObserverError> + Send + Sync>;

/// Routes classified transactions to handlers registered per kind.
#[derive(Default)]
pub struct OverlayDispatcher {
    handlers: RwLock<HashMap<TxKind, Vec<TxHandler>>>,
    counts: RwLock<BTreeMap<&'static str, u64>>,
}

impl OverlayDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: TxKind, handler: TxHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Transactions seen per storage category since start.
    pub fn category_counts(&self) -> BTreeMap<&'static str, u64> {
        self.counts.read().clone()
    }
}

impl BlockObserver for OverlayDispatcher {
    fn name(&self) -> &str {
        "overlay-dispatcher"
    }

    fn block_connected(&self, block: &ClassifiedBlock<'_>) -> Result<(), ObserverError> {
        let handlers = self.handlers.read();
        let mut failures = Vec::new();
        for (tx, kind) in block.transactions() {
            if let Some(category) = kind.category() {
                *self.counts.write().entry(category).or_insert(0) += 1;
            }
            let Some(list) = handlers.get(&kind) else {
                continue;
            };
            for handler in list {
                // keep going: one bad handler must not starve the rest
                if let Err(e) = handler(tx, block.height) {
                    failures.push(e.to_string());
                }
            }
        }
        debug!("Dispatched {} txs of block {}", block.kinds.len(), block.hash);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ObserverError::new(self.name(), failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::script::op_return;
    use pocket_core::{ConsensusParams, OutPoint, TxIn, TxOut};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn block_with_post() -> Block {
        let mut block = ConsensusParams::regtest().genesis_block();
        block.transactions.push(Transaction::new(
            vec![TxIn::new(OutPoint::new(Hash256([1; 32]), 0), vec![])],
            vec![TxOut::new(0, op_return(&[b"share", b"hash"]))],
        ));
        block
    }

    #[test]
    fn test_routes_by_kind() {
        let dispatcher = OverlayDispatcher::new();
        let posts = Arc::new(AtomicU32::new(0));
        let seen = posts.clone();
        dispatcher.register(
            TxKind::ContentPost,
            Box::new(move |_, height| {
                assert_eq!(height, 4);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let block = block_with_post();
        let classified = ClassifiedBlock::new(&block, 4);
        assert_eq!(classified.kinds, vec![TxKind::Coinbase, TxKind::ContentPost]);
        dispatcher.block_connected(&classified).unwrap();
        assert_eq!(posts.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.category_counts().get("Posts"), Some(&1));
    }

    #[test]
    fn test_handler_failure_reported_not_fatal() {
        let dispatcher = OverlayDispatcher::new();
        dispatcher.register(
            TxKind::ContentPost,
            Box::new(|_, _| Err(ObserverError::new("posts", "index offline"))),
        );
        let block = block_with_post();
        let err = dispatcher
            .block_connected(&ClassifiedBlock::new(&block, 1))
            .unwrap_err();
        assert!(err.reason.contains("index offline"));
        // the notify helpers swallow it
        let observers: Vec<Arc<dyn BlockObserver>> = vec![Arc::new(dispatcher)];
        notify_connected(&observers, &ClassifiedBlock::new(&block, 1));
    }
}
