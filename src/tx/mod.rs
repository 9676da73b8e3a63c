//! Transaction execution: retry classification, state tracking, commit
//! coordination and ambiguous-commit resolution.

pub mod classifier;
mod coordinator;
mod state;
pub mod validator;

pub use classifier::{classify, Disposition, Phase};
pub use coordinator::{CommitOutcome, TransactionCoordinator};
pub use state::{Transaction, TxState};
pub use validator::{Resolution, TxValidator, ValidationRecord};
