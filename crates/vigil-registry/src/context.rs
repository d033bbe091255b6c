//! Per-request account context

use crate::model::Account;

/// The account a request acts on plus a transaction id for log correlation
#[derive(Debug, Clone)]
pub struct AccountContext {
    pub account: Account,
    pub txn_id: String,
}

impl AccountContext {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            txn_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn with_txn_id(mut self, txn_id: impl Into<String>) -> Self {
        self.txn_id = txn_id.into();
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }
}
