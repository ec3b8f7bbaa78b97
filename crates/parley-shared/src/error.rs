use thiserror::Error;

use crate::models::ScanStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Illegal scan status transition: {from:?} -> {to:?}")]
    IllegalScanTransition { from: ScanStatus, to: ScanStatus },

    #[error("Conversation needs at least two participants, got {0}")]
    TooFewParticipants(usize),
}
