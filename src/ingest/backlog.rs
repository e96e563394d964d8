//! Edge-triggered backlog warning.

/// Change in backlog condition reported by [`BacklogMonitor::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogTransition {
    /// Depth went above the high-water mark.
    Raised { depth: usize },
    /// Depth is back at or below the mark.
    Cleared { depth: usize },
}

/// Tracks whether the buffer depth is above its high-water mark and reports
/// only the crossings, never the level.
#[derive(Debug, Clone)]
pub struct BacklogMonitor {
    high_watermark: usize,
    raised: bool,
}

impl BacklogMonitor {
    pub fn new(high_watermark: usize) -> Self {
        Self {
            high_watermark,
            raised: false,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn observe(&mut self, depth: usize) -> Option<BacklogTransition> {
        match (self.raised, depth > self.high_watermark) {
            (false, true) => {
                self.raised = true;
                Some(BacklogTransition::Raised { depth })
            }
            (true, false) => {
                self.raised = false;
                Some(BacklogTransition::Cleared { depth })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_warning_per_crossing() {
        let mut monitor = BacklogMonitor::new(10);

        assert_eq!(monitor.observe(5), None);
        assert_eq!(monitor.observe(10), None);
        assert_eq!(monitor.observe(11), Some(BacklogTransition::Raised { depth: 11 }));
        assert_eq!(monitor.observe(50), None);
        assert_eq!(monitor.observe(12), None);
        assert!(monitor.is_raised());

        assert_eq!(monitor.observe(3), Some(BacklogTransition::Cleared { depth: 3 }));
        assert_eq!(monitor.observe(2), None);
        assert_eq!(monitor.observe(20), Some(BacklogTransition::Raised { depth: 20 }));
    }
}
