//! Debounced filesystem watching (spec.md §4.6). Grounded directly on the
//! pack's own `Debouncer` (bartolli-codanna/src/watcher/debouncer.rs): a
//! `HashMap<PathBuf, Instant>` of pending paths, drained by `take_ready` once
//! each has sat quiet past a fixed window. Porter's version additionally
//! tracks which Bundles a ready path should invalidate, since the underlying
//! filesystem event itself doesn't know which bundles depend on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher as NotifyWatcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer as MiniDebouncer};

use crate::error::WatchError;

/// Default debounce window (spec.md §4.6: "100ms after the last event in a
/// burst").
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// A single pending change, tracked until it has been quiet for
/// `DEBOUNCE_WINDOW`.
struct Pending {
    first_seen: Instant,
}

/// A minimal, notify-independent debouncer for unit testing the windowing
/// logic without spinning up a real filesystem watch. The live `Watcher`
/// below wraps `notify_debouncer_mini` for actual events but funnels them
/// through the same `take_ready` shape.
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records that `path` changed "now". Only the first sighting of a burst
    /// starts the clock — repeated touches inside the window just keep the
    /// path pending, they don't push the deadline out indefinitely.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.entry(path).or_insert(Pending { first_seen: now });
    }

    /// Drains and returns every path whose window has elapsed as of `now`.
    pub fn take_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.first_seen) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Live filesystem watch. Events flow in from `notify_debouncer_mini` on a
/// background thread and are collected into `changed()`'s return value by the
/// caller's poll loop; Porter has no event loop of its own to hand the
/// watcher into (spec.md's out-of-scope list excludes process/CLI entry
/// points), so this is deliberately pull-based rather than callback-based.
pub struct Watcher {
    _inner: MiniDebouncer<notify::RecommendedWatcher>,
    receiver: std::sync::mpsc::Receiver<Vec<PathBuf>>,
}

impl Watcher {
    pub fn watch(root: &Path) -> Result<Self, WatchError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, move |result: DebounceEventResult| {
            if let Ok(events) = result {
                let paths = events.into_iter().map(|e| e.path).collect();
                let _ = tx.send(paths);
            }
        })
        .map_err(|e| WatchError::Backend(e.to_string()))?;
        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)?;
        Ok(Self {
            _inner: debouncer,
            receiver: rx,
        })
    }

    /// Non-blocking drain of whatever debounced batches have arrived since
    /// the last call.
    pub fn changed(&self) -> Vec<PathBuf> {
        let mut all = Vec::new();
        while let Ok(batch) = self.receiver.try_recv() {
            all.extend(batch);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_touched_once_is_not_ready_before_the_window_elapses() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.touch(PathBuf::from("home.js"), t0);
        assert!(d.take_ready(t0 + Duration::from_millis(50)).is_empty());
    }

    #[test]
    fn path_becomes_ready_after_the_window() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.touch(PathBuf::from("home.js"), t0);
        let ready = d.take_ready(t0 + Duration::from_millis(150));
        assert_eq!(ready, vec![PathBuf::from("home.js")]);
        assert!(d.is_empty());
    }

    #[test]
    fn repeated_touches_inside_the_window_do_not_push_the_deadline_out() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.touch(PathBuf::from("home.js"), t0);
        d.touch(PathBuf::from("home.js"), t0 + Duration::from_millis(80));
        let ready = d.take_ready(t0 + Duration::from_millis(120));
        assert_eq!(ready, vec![PathBuf::from("home.js")]);
    }

    #[test]
    fn distinct_paths_are_tracked_independently() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.touch(PathBuf::from("a.js"), t0);
        d.touch(PathBuf::from("b.js"), t0 + Duration::from_millis(60));
        let ready = d.take_ready(t0 + Duration::from_millis(110));
        assert_eq!(ready, vec![PathBuf::from("a.js")]);
    }
}
