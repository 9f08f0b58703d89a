//! Progress-callback trait for per-range extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline detects forms and works through each range.
//!
//! # Example
//!
//! ```rust
//! use edgequake_taxforms::{ExtractionConfig, ExtractionProgressCallback, FormRange};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_range_complete(&self, range: &FormRange, records: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{range}: {records} record(s)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::RangeError;
use crate::ranges::FormRange;
use std::sync::Arc;

/// Called by the extraction pipeline as it processes each form range.
///
/// Ranges run concurrently, so `on_range_*` methods may be called from
/// several tasks at once. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after page classification, before any backend call.
    fn on_detection_complete(&self, ranges: &[FormRange]) {
        let _ = ranges;
    }

    /// Called before the first page of `range` is rendered.
    fn on_range_start(&self, range: &FormRange) {
        let _ = range;
    }

    /// Called when `range` produced `records` consolidated records.
    fn on_range_complete(&self, range: &FormRange, records: usize) {
        let _ = (range, records);
    }

    /// Called when `range` failed; sibling ranges keep going.
    fn on_range_error(&self, range: &FormRange, error: &RangeError) {
        let _ = (range, error);
    }

    /// Called once after every range has been attempted.
    ///
    /// # Arguments
    /// * `total_ranges`: ranges detected
    /// * `success_count`: ranges that produced records
    fn on_extraction_complete(&self, total_ranges: usize, success_count: usize) {
        let _ = (total_ranges, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::FormType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        detected: AtomicUsize,
        starts: AtomicUsize,
        records: AtomicUsize,
        errors: Mutex<Vec<String>>,
        succeeded: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_detection_complete(&self, ranges: &[FormRange]) {
            self.detected.store(ranges.len(), Ordering::SeqCst);
        }

        fn on_range_start(&self, _range: &FormRange) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_range_complete(&self, _range: &FormRange, records: usize) {
            self.records.fetch_add(records, Ordering::SeqCst);
        }

        fn on_range_error(&self, range: &FormRange, error: &RangeError) {
            self.errors.lock().unwrap().push(format!("{range}: {error}"));
        }

        fn on_extraction_complete(&self, _total_ranges: usize, success_count: usize) {
            self.succeeded.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let range = FormRange::new(FormType::W2, 1, 1);
        cb.on_detection_complete(std::slice::from_ref(&range));
        cb.on_range_start(&range);
        cb.on_range_complete(&range, 1);
        cb.on_range_error(
            &range,
            &RangeError::BackendFatal {
                detail: "401".into(),
            },
        );
        cb.on_extraction_complete(1, 0);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        let k1 = FormRange::new(FormType::ScheduleK1, 1, 3);
        let k3 = FormRange::new(FormType::ScheduleK3, 4, 9);

        tracker.on_detection_complete(&[k1, k3]);
        tracker.on_range_start(&k1);
        tracker.on_range_start(&k3);
        tracker.on_range_complete(&k1, 2);
        tracker.on_range_error(
            &k3,
            &RangeError::NoBackend {
                detail: "no keys".into(),
            },
        );
        tracker.on_extraction_complete(2, 1);

        assert_eq!(tracker.detected.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.records.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.succeeded.load(Ordering::SeqCst), 1);
        let errors = tracker.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no keys"));
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_range_start(&FormRange::new(FormType::Form8805, 2, 5));
    }
}
