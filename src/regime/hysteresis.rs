//! Label hysteresis with tightening bypass. A pending label must persist for
//! `min_bars_hold` consecutive bars before it commits, unless the change is a
//! tightening, which applies on the same bar it is first seen. The tightening
//! test is injected as a pure function so the tracker stays decoupled from
//! policy internals.

#[derive(Debug, Default, Clone)]
pub struct HysteresisTracker {
    current: Option<String>,
    pending: Option<String>,
    pending_count: u32,
}

impl HysteresisTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Observe a freshly computed label and return the committed label for
    /// this bar. `is_tightening(old, new)` decides bypass.
    pub fn observe<F>(&mut self, new_label: &str, min_bars_hold: u32, is_tightening: F) -> String
    where
        F: Fn(&str, &str) -> bool,
    {
        match self.current.as_deref() {
            // first assignment applies immediately
            None => {
                self.current = Some(new_label.to_string());
            }
            Some(current) if current == new_label => {
                self.pending = None;
                self.pending_count = 0;
            }
            Some(current) if is_tightening(current, new_label) => {
                self.current = Some(new_label.to_string());
                self.pending = None;
                self.pending_count = 0;
            }
            Some(_) => {
                if self.pending.as_deref() == Some(new_label) {
                    self.pending_count += 1;
                } else {
                    self.pending = Some(new_label.to_string());
                    self.pending_count = 1;
                }
                if self.pending_count >= min_bars_hold {
                    self.current = Some(new_label.to_string());
                    self.pending = None;
                    self.pending_count = 0;
                }
            }
        }
        self.current.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tightening(old: &str, new: &str) -> bool {
        // in these tests "bear" is always stricter than anything else
        new == "bear" && old != "bear"
    }

    #[test]
    fn first_assignment_is_immediate() {
        let mut t = HysteresisTracker::new();
        assert_eq!(t.observe("bull", 3, tightening), "bull");
    }

    #[test]
    fn tightening_bypasses_min_hold() {
        let mut t = HysteresisTracker::new();
        t.observe("bull", 3, tightening);
        // bull -> bear tightens: same-bar application
        assert_eq!(t.observe("bear", 3, tightening), "bear");
    }

    #[test]
    fn loosening_requires_min_hold() {
        let mut t = HysteresisTracker::new();
        t.observe("bull", 3, tightening);
        t.observe("bear", 3, tightening);
        // bear -> bull loosens: held for two bars, commits on the third
        assert_eq!(t.observe("bull", 3, tightening), "bear");
        assert_eq!(t.observe("bull", 3, tightening), "bear");
        assert_eq!(t.observe("bull", 3, tightening), "bull");
    }

    #[test]
    fn interrupted_pending_resets_the_count() {
        let mut t = HysteresisTracker::new();
        t.observe("bull", 3, tightening);
        t.observe("bear", 3, tightening);
        t.observe("bull", 3, tightening);
        t.observe("bull", 3, tightening);
        // reverting to the current label clears the pending streak
        t.observe("bear", 3, tightening);
        assert_eq!(t.observe("bull", 3, tightening), "bear");
        assert_eq!(t.observe("bull", 3, tightening), "bear");
        assert_eq!(t.observe("bull", 3, tightening), "bull");
    }

    #[test]
    fn min_hold_one_commits_immediately() {
        let mut t = HysteresisTracker::new();
        t.observe("bull", 1, tightening);
        assert_eq!(t.observe("chop", 1, tightening), "chop");
    }
}
