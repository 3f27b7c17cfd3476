pub mod amount;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logger;
pub mod payout;
pub mod quote;
pub mod replay;
pub mod state;
pub mod storage;

pub use amount::Amount;
pub use error::{Error, Result};
pub use ledger::Ledger;

/// Generate a random identifier such as `res_3f9a0c1d2b4e5f60`.
pub fn new_id(prefix: &str) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}_{}", prefix, hex::encode(bytes))
}
