use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single run-scoped stop signal, cheap to clone and shared by every stage.
///
/// Cancellation is cooperative: the labeler polls it during long traversals and the
/// worker pool polls it before taking each new unit of work. Nothing is interrupted
/// mid-flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }
}
