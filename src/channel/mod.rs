pub mod merkle;
pub mod proof;
pub mod state;

pub use merkle::{Lock, LockTree, LockTreeError, MAX_PENDING_LOCKS};
pub use proof::{BalanceProof, ProofError};
pub use state::{ChannelError, ChannelResult, ChannelState, ChannelStatus, End, ParticipantState};

#[cfg(test)]
pub mod tests;
