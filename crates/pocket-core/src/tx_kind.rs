use serde::{Deserialize, Serialize};

use crate::script;
use crate::transaction::Transaction;

/// Application meaning of a transaction, read from the `OP_RETURN` tag in
/// its first output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxKind {
    NotSupported,
    Coinbase,
    Coinstake,
    Default,
    AccountUser,
    AccountSetting,
    ContentPost,
    ContentVideo,
    ContentArticle,
    ContentDelete,
    BoostContent,
    ContentComment,
    ContentCommentEdit,
    ContentCommentDelete,
    ScoreContent,
    ScoreComment,
    Complain,
    Subscribe,
    SubscribePrivate,
    Unsubscribe,
    Blocking,
    Unblocking,
}

/// OP_RETURN tag -> kind.
const TAGS: &[(&[u8], TxKind)] = &[
    (b"share", TxKind::ContentPost),
    (b"shareEdit", TxKind::ContentPost),
    (b"video", TxKind::ContentVideo),
    (b"article", TxKind::ContentArticle),
    (b"contentDelete", TxKind::ContentDelete),
    (b"contentBoost", TxKind::BoostContent),
    (b"comment", TxKind::ContentComment),
    (b"commentEdit", TxKind::ContentCommentEdit),
    (b"commentDelete", TxKind::ContentCommentDelete),
    (b"upvoteShare", TxKind::ScoreContent),
    (b"cScore", TxKind::ScoreComment),
    (b"complainShare", TxKind::Complain),
    (b"subscribe", TxKind::Subscribe),
    (b"subscribePrivate", TxKind::SubscribePrivate),
    (b"unsubscribe", TxKind::Unsubscribe),
    (b"userInfo", TxKind::AccountUser),
    (b"accSet", TxKind::AccountSetting),
    (b"blocking", TxKind::Blocking),
    (b"unblocking", TxKind::Unblocking),
];

impl TxKind {
    pub fn classify(tx: &Transaction) -> TxKind {
        if tx.is_coinbase() {
            // a coinbase paying nothing carries no application data
            return match tx.value_out() {
                Some(total) if total > 0 => TxKind::Coinbase,
                _ => TxKind::NotSupported,
            };
        }
        if tx.is_coinstake() {
            return TxKind::Coinstake;
        }
        tx.outputs
            .first()
            .and_then(|out| script::op_return_pushes(&out.script_pubkey))
            .and_then(|pushes| pushes.first().copied())
            .map(TxKind::from_tag)
            .unwrap_or(TxKind::Default)
    }

    pub fn from_tag(tag: &[u8]) -> TxKind {
        TAGS.iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, kind)| *kind)
            .unwrap_or(TxKind::Default)
    }

    /// Storage category the social index files this kind under.
    pub fn category(&self) -> Option<&'static str> {
        match self {
            TxKind::AccountSetting => Some("AccountSettings"),
            TxKind::AccountUser => Some("Users"),
            TxKind::ContentPost
            | TxKind::ContentVideo
            | TxKind::ContentArticle
            | TxKind::ContentDelete => Some("Posts"),
            TxKind::ContentComment
            | TxKind::ContentCommentEdit
            | TxKind::ContentCommentDelete => Some("Comment"),
            TxKind::ScoreContent => Some("Scores"),
            TxKind::ScoreComment => Some("CommentScores"),
            TxKind::Complain => Some("Complains"),
            TxKind::Blocking | TxKind::Unblocking => Some("Blocking"),
            TxKind::Subscribe | TxKind::SubscribePrivate | TxKind::Unsubscribe => {
                Some("Subscribes")
            }
            TxKind::BoostContent => Some("Boosts"),
            TxKind::NotSupported | TxKind::Coinbase | TxKind::Coinstake | TxKind::Default => None,
        }
    }

    /// Carries social-layer data.
    pub fn is_social(&self) -> bool {
        self.category().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash256;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    fn tagged(tag: &[u8]) -> Transaction {
        Transaction::new(
            vec![TxIn::new(OutPoint::new(Hash256([1; 32]), 0), vec![])],
            vec![
                TxOut::new(0, script::op_return(&[tag, b"payload-hash"])),
                TxOut::new(10, vec![0x51]),
            ],
        )
    }

    #[test]
    fn test_classify_social_tags() {
        assert_eq!(TxKind::classify(&tagged(b"share")), TxKind::ContentPost);
        assert_eq!(TxKind::classify(&tagged(b"upvoteShare")), TxKind::ScoreContent);
        assert_eq!(TxKind::classify(&tagged(b"unsubscribe")), TxKind::Unsubscribe);
        assert_eq!(TxKind::classify(&tagged(b"nonsense")), TxKind::Default);
    }

    #[test]
    fn test_classify_rewards() {
        let cb = Transaction::coinbase(3, vec![TxOut::new(50, vec![0x51])]);
        assert_eq!(TxKind::classify(&cb), TxKind::Coinbase);
        let empty_cb = Transaction::coinbase(3, vec![TxOut::new(0, vec![0x51])]);
        assert_eq!(TxKind::classify(&empty_cb), TxKind::NotSupported);

        let mut stake = tagged(b"share");
        stake.outputs[0] = TxOut::empty();
        assert_eq!(TxKind::classify(&stake), TxKind::Coinstake);
    }

    #[test]
    fn test_plain_payment_is_default() {
        let mut tx = tagged(b"share");
        tx.outputs.remove(0);
        assert_eq!(TxKind::classify(&tx), TxKind::Default);
    }

    #[test]
    fn test_categories() {
        assert_eq!(TxKind::ContentVideo.category(), Some("Posts"));
        assert_eq!(TxKind::ContentCommentDelete.category(), Some("Comment"));
        assert_eq!(TxKind::Unblocking.category(), Some("Blocking"));
        assert_eq!(TxKind::Coinbase.category(), None);
        assert!(!TxKind::Default.is_social());
    }
}
