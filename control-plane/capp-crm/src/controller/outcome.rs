use std::fmt;

use super::dependent::DependentKind;

/// What one synchronizer did to one dependent kind during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Not requested and not present
    Skipped,
    /// The write lost an optimistic-concurrency race
    Conflict(String),
    Failed(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Conflict(_) | Outcome::Failed(_))
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated | Outcome::Deleted)
    }

    /// Short PascalCase label, used as a condition reason.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "Created",
            Outcome::Updated => "Updated",
            Outcome::Unchanged => "Unchanged",
            Outcome::Deleted => "Deleted",
            Outcome::Skipped => "Skipped",
            Outcome::Conflict(_) => "Conflict",
            Outcome::Failed(_) => "Failed",
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            Outcome::Conflict(c) | Outcome::Failed(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause() {
            Some(cause) => write!(f, "{}: {}", self.label(), cause),
            None => f.write_str(self.label()),
        }
    }
}

/// How soon the caller should schedule the next pass for the same Capp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Converged; wait for the next change or periodic resync
    NoRetry,
    /// Writes were made; come back shortly to observe their effect
    RetrySoon,
    RetryWithBackoff,
}

impl RetryDirective {
    pub fn from_outcomes<'a>(
        outcomes: impl IntoIterator<Item = &'a Outcome>,
    ) -> Self {
        let mut wrote = false;
        for outcome in outcomes {
            if outcome.is_error() {
                return RetryDirective::RetryWithBackoff;
            }
            wrote |= outcome.is_write();
        }
        if wrote {
            RetryDirective::RetrySoon
        } else {
            RetryDirective::NoRetry
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub directive: RetryDirective,
    /// One entry per kind that was synchronized, in the order it ran
    pub outcomes: Vec<(DependentKind, Outcome)>,
}

impl PassReport {
    /// A pass that stopped before synchronizing anything.
    pub fn early(directive: RetryDirective) -> Self {
        Self {
            directive,
            outcomes: Vec::new(),
        }
    }

    pub fn outcome(&self, kind: DependentKind) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, o)| o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_dominate_writes() {
        let outcomes = [
            Outcome::Created,
            Outcome::Conflict("stale".into()),
            Outcome::Unchanged,
        ];
        assert_eq!(
            RetryDirective::from_outcomes(&outcomes),
            RetryDirective::RetryWithBackoff
        );
    }

    #[test]
    fn writes_ask_for_a_quick_recheck() {
        let outcomes = [Outcome::Unchanged, Outcome::Deleted, Outcome::Skipped];
        assert_eq!(
            RetryDirective::from_outcomes(&outcomes),
            RetryDirective::RetrySoon
        );
    }

    #[test]
    fn steady_state_needs_no_retry() {
        let outcomes = [Outcome::Unchanged, Outcome::Skipped];
        assert_eq!(
            RetryDirective::from_outcomes(&outcomes),
            RetryDirective::NoRetry
        );
        assert_eq!(
            RetryDirective::from_outcomes(std::iter::empty()),
            RetryDirective::NoRetry
        );
    }

    #[test]
    fn display_includes_cause() {
        assert_eq!(Outcome::Failed("boom".into()).to_string(), "Failed: boom");
        assert_eq!(Outcome::Skipped.to_string(), "Skipped");
    }
}
