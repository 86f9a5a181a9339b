//! Abstract interfaces for ledger components.
//!
//! These traits define the contracts for:
//! - Event storage (persistence)
//! - Human confirmation channel (withdrawal confirmation)
//! - Payout rail (money movement)
//! - KYC verifier (identity verification)

pub mod event_store;
pub mod external;

pub use event_store::{EventPage, EventStore, KeyedEvent, NewEvent, StorageError};
pub use external::{
    ClientError, ConfirmationChannel, KycVerifier, PayoutRail, PayoutReceipt,
};
