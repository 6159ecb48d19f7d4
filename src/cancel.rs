use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Stage};

/// Cooperative cancellation shared by all jobs of a run.
///
/// A token trips either when `cancel()` is called (Ctrl-C) or when its
/// wall-clock budget runs out. Work checks it between ticker loads and
/// between window batches; nothing is interrupted mid-computation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check(Stage::Fetch).is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            token.check(Stage::Compute),
            Err(PipelineError::Cancelled {
                stage: Stage::Compute
            })
        ));
    }

    #[test]
    fn test_expired_budget_cancels() {
        let token = CancelToken::with_budget(Duration::ZERO);
        assert!(token.is_cancelled());
        let roomy = CancelToken::with_budget(Duration::from_secs(3600));
        assert!(!roomy.is_cancelled());
    }
}
