//! Retry policy for units of work.
//!
//! A unit of work that fails is retried only when the connection itself turned
//! out to be broken and the caller was not inside an explicit transaction.
//! Anything else is surfaced to the caller unchanged.

/// What the handle found after a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The validity check still succeeds: the failure was the statement's own.
    ConnectionAlive,
    /// The validity check failed or timed out.
    ConnectionBroken,
}

/// Outcome of one retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reconnect and run the unit of work again.
    Retry,
    /// Hand the error to the caller.
    Surface,
}

/// Decide whether attempt number `attempt` (0-based) may be followed by another.
///
/// `budget` is the configured `retry_count`; a unit of work runs at most
/// `budget + 1` times.
pub fn decide(attempt: u32, budget: u32, failure: FailureKind, auto_commit: bool) -> Decision {
    if !auto_commit {
        // a retry would silently drop the statements already in the transaction
        return Decision::Surface;
    }
    match failure {
        FailureKind::ConnectionAlive => Decision::Surface,
        FailureKind::ConnectionBroken if attempt < budget => Decision::Retry,
        FailureKind::ConnectionBroken => Decision::Surface,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_connection_retries_within_budget() {
        assert_eq!(decide(0, 2, FailureKind::ConnectionBroken, true), Decision::Retry);
        assert_eq!(decide(1, 2, FailureKind::ConnectionBroken, true), Decision::Retry);
        assert_eq!(decide(2, 2, FailureKind::ConnectionBroken, true), Decision::Surface);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        assert_eq!(decide(0, 0, FailureKind::ConnectionBroken, true), Decision::Surface);
    }

    #[test]
    fn test_live_connection_surfaces() {
        assert_eq!(decide(0, 5, FailureKind::ConnectionAlive, true), Decision::Surface);
    }

    #[test]
    fn test_open_transaction_surfaces() {
        assert_eq!(decide(0, 5, FailureKind::ConnectionBroken, false), Decision::Surface);
    }
}
