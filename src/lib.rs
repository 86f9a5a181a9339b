//! Commission Ledger - affiliate commissions and referral attribution
//!
//! An event-sourced system of record that attributes paid calls to referrers,
//! tracks time-bounded multi-tier recruitment, moves commissions through a
//! hold/validation/payout lifecycle with refund clawback, and gates
//! withdrawals behind balance, KYC, and human confirmation.

pub mod attribution;
pub mod clients;
pub mod config;
pub mod events;
pub mod facade;
pub mod fraud;
pub mod interfaces;
pub mod leaderboard;
pub mod ledger;
pub mod model;
pub mod referral;
pub mod repository;
pub mod services;
pub mod storage;
pub mod utils;
pub mod withdrawal;

pub use facade::{AffiliateLedger, AffiliateLedgerBuilder, FacadeError};
