//! Service layer over the ledger components.

pub mod dashboard;
pub mod ingress;
pub mod scheduler;

pub use dashboard::{
    DashboardError, DashboardService, DashboardSummary, HistoryPage, LeaderboardView, PageRequest,
};
pub use ingress::{CallCompleted, CallOutcome, IngressError, IngressService, RecruitRegistered};
pub use scheduler::{Scheduler, TickReport};
