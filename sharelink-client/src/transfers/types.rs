//! Transfer types
//!
//! Direction and lifecycle status of a [`TransferTask`], and the delegate
//! trait for callers that prefer one observer object over closures.

use serde::{Deserialize, Serialize};
use sharelink_common::SessionError;

use super::TransferTask;

// =============================================================================
// Transfer Direction
// =============================================================================

/// Direction of the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Device to local disk
    Download,
    /// Local disk to device
    Upload,
}

// =============================================================================
// Transfer Status
// =============================================================================

/// Lifecycle of a transfer task
///
/// `Ready -> Running <-> Suspended`, then exactly one of the terminal states.
/// A task never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, not started
    Ready,
    /// Preparing or moving data
    Running,
    /// Parked at a chunk boundary until resumed
    Suspended,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the caller or by its session closing
    Cancelled,
}

impl TransferStatus {
    /// Returns true once the task has finished, whatever the outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

// =============================================================================
// Delegate
// =============================================================================

/// Observer for a transfer, called on the session's callback thread
///
/// Set with [`TransferTask::set_delegate`]. Closure handlers and the delegate
/// may be used together; closures run first.
pub trait TransferDelegate: Send + Sync {
    /// Bytes moved so far out of the expected total
    fn progress(&self, _task: &TransferTask, _bytes_transferred: u64, _total_bytes: u64) {}

    /// The transfer finished; `path` is where the file ended up
    fn succeeded(&self, task: &TransferTask, path: &str);

    /// The transfer failed or was cancelled
    fn failed(&self, task: &TransferTask, error: &SessionError);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TransferStatus::Ready.is_terminal());
        assert!(!TransferStatus::Running.is_terminal());
        assert!(!TransferStatus::Suspended.is_terminal());
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::Suspended).unwrap(),
            "\"suspended\""
        );
        assert_eq!(
            serde_json::from_str::<TransferDirection>("\"upload\"").unwrap(),
            TransferDirection::Upload
        );
    }
}
