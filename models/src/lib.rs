pub use self::block::*;
pub use self::message::*;
pub use self::tokens::*;
pub use self::transaction::*;

mod block;
mod message;
mod tokens;
mod transaction;

/// Rows accumulated while processing the blocks of a single masterchain seqno.
#[derive(Debug, Default, Clone)]
pub struct ProcessingContext {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub messages: Vec<Message>,
    pub transaction_messages: Vec<TransactionMessage>,
    pub account_updates: Vec<AccountUpdate>,
}

impl ProcessingContext {
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.transactions.clear();
        self.messages.clear();
        self.transaction_messages.clear();
        self.account_updates.clear();
    }

    pub fn extend(&mut self, other: ProcessingContext) {
        self.blocks.extend(other.blocks);
        self.transactions.extend(other.transactions);
        self.messages.extend(other.messages);
        self.transaction_messages.extend(other.transaction_messages);
        self.account_updates.extend(other.account_updates);
    }
}
