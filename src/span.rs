//! Spans and the reporting seam.
//!
//! A [`Span`] is a handle: clones refer to the same unit of work, so a stream wrapper, its
//! context and the interceptor that created it can all hold the span and any of them may
//! finish it. Finishing is strictly idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::header::{TraceContext, TraceOptions};

/// Receives every sampled span once it is finished.
pub trait Reporter: Send + Sync + 'static {
    /// Called exactly once per finished, sampled span.
    fn report(&self, span: FinishedSpan);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn report(&self, span: FinishedSpan) {
        (**self).report(span)
    }
}

/// Reporter that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _span: FinishedSpan) {}
}

/// Reporter that emits one structured `tracing` event per finished span.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, span: FinishedSpan) {
        let duration = span.duration();
        tracing::info!(
            trace_id = %span.trace_id,
            span_id = span.span_id,
            parent_span_id = span.parent_span_id,
            name = %span.name,
            duration_us = duration.as_micros() as u64,
            labels = ?span.labels,
            "span finished"
        );
    }
}

/// Snapshot of a span at the moment it was finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedSpan {
    /// Span name, usually the full RPC method.
    pub name: String,
    /// Trace identifier shared with every span of the trace.
    pub trace_id: String,
    /// Identifier of this span.
    pub span_id: u64,
    /// Identifier of the parent span, zero for a root.
    pub parent_span_id: u64,
    /// Trace options in effect.
    pub options: TraceOptions,
    /// Labels attached before the span finished.
    pub labels: BTreeMap<String, String>,
    /// When the span was created.
    pub start: SystemTime,
    /// When the span was finished.
    pub end: SystemTime,
}

impl FinishedSpan {
    /// Wall-clock duration; zero if the clock went backwards.
    pub fn duration(&self) -> std::time::Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

/// State shared by every span of one trace.
struct Trace {
    trace_id: String,
    options: TraceOptions,
    reporter: Arc<dyn Reporter>,
}

struct Inner {
    trace: Arc<Trace>,
    name: String,
    span_id: u64,
    parent_span_id: u64,
    start: SystemTime,
    labels: Mutex<BTreeMap<String, String>>,
    finished: AtomicBool,
}

/// A named, time-bounded unit of traced work.
#[derive(Clone)]
pub struct Span {
    inner: Arc<Inner>,
}

impl Span {
    /// Starts the root span of a new trace with a random trace id.
    pub(crate) fn new_root(name: &str, options: TraceOptions, reporter: Arc<dyn Reporter>) -> Self {
        Self::new_remote_child(name, &new_trace_id(), 0, options, reporter)
    }

    /// Starts a span whose parent lives in another process.
    pub(crate) fn new_remote_child(
        name: &str,
        trace_id: &str,
        parent_span_id: u64,
        options: TraceOptions,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let trace = Arc::new(Trace {
            trace_id: trace_id.to_owned(),
            options,
            reporter,
        });
        Self::start(trace, name, parent_span_id)
    }

    fn start(trace: Arc<Trace>, name: &str, parent_span_id: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                trace,
                name: name.to_owned(),
                span_id: new_span_id(),
                parent_span_id,
                start: SystemTime::now(),
                labels: Mutex::new(BTreeMap::new()),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a child of this span in the same trace, inheriting its options.
    pub fn new_child(&self, name: &str) -> Span {
        Self::start(self.inner.trace.clone(), name, self.inner.span_id)
    }

    /// Attaches a label. Labels set after the span finished are ignored.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        self.inner.labels.lock().insert(key.into(), value.into());
    }

    /// Ends the span and hands it to the reporter if the trace is sampled.
    ///
    /// Only the first call has any effect; it returns `true`. Concurrent callers race on an
    /// atomic flag, so exactly one of them reports.
    pub fn finish(&self) -> bool {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return false;
        }

        let end = SystemTime::now();
        let trace = &self.inner.trace;
        tracing::trace!(
            trace_id = %trace.trace_id,
            span_id = self.inner.span_id,
            name = %self.inner.name,
            "finishing span"
        );

        if trace.options.is_sampled() {
            let labels = std::mem::take(&mut *self.inner.labels.lock());
            trace.reporter.report(FinishedSpan {
                name: self.inner.name.clone(),
                trace_id: trace.trace_id.clone(),
                span_id: self.inner.span_id,
                parent_span_id: self.inner.parent_span_id,
                options: trace.options,
                labels,
                start: self.inner.start,
                end,
            });
        }
        true
    }

    /// Returns `true` once [`Span::finish`] has been called.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Identifier of the trace this span belongs to.
    pub fn trace_id(&self) -> &str {
        &self.inner.trace.trace_id
    }

    /// Identifier of this span.
    pub fn span_id(&self) -> u64 {
        self.inner.span_id
    }

    /// Identifier of the parent span, zero for a root span.
    pub fn parent_span_id(&self) -> u64 {
        self.inner.parent_span_id
    }

    /// Options of the trace.
    pub fn options(&self) -> TraceOptions {
        self.inner.trace.options
    }

    /// Span name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value of a label.
    pub fn label(&self, key: &str) -> Option<String> {
        self.inner.labels.lock().get(key).cloned()
    }

    /// Identifiers of this span as a header context.
    pub fn context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id().to_owned(),
            span_id: self.span_id(),
            parent_span_id: self.parent_span_id(),
            options: self.options(),
        }
    }

    /// Returns `true` if both handles refer to the same span.
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.inner.name)
            .field("trace_id", &self.inner.trace.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("parent_span_id", &self.inner.parent_span_id)
            .field("options", &self.inner.trace.options)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn new_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

// Zero means "no parent" on the wire, so it is never handed out.
fn new_span_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FinishedSpan>>);

    impl Reporter for Recorder {
        fn report(&self, span: FinishedSpan) {
            self.0.lock().push(span);
        }
    }

    fn sampled_root(recorder: &Arc<Recorder>) -> Span {
        Span::new_root("root", TraceOptions::SAMPLED, recorder.clone())
    }

    #[test]
    fn child_shares_trace_and_points_at_parent() {
        let recorder = Arc::new(Recorder::default());
        let root = sampled_root(&recorder);
        let child = root.new_child("/pkg.Service/Method");

        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.parent_span_id(), root.span_id());
        assert_ne!(child.span_id(), root.span_id());
        assert_eq!(child.options(), root.options());
        assert_eq!(child.name(), "/pkg.Service/Method");
        assert_eq!(root.trace_id().len(), 32);
    }

    #[test]
    fn finish_reports_once() {
        let recorder = Arc::new(Recorder::default());
        let span = sampled_root(&recorder);
        span.set_label("error", "boom");

        assert!(span.finish());
        assert!(!span.finish());
        assert!(!span.clone().finish());

        let reported = recorder.0.lock();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].labels.get("error").map(String::as_str), Some("boom"));
        assert!(reported[0].end >= reported[0].start);
    }

    #[test]
    fn labels_after_finish_are_ignored() {
        let recorder = Arc::new(Recorder::default());
        let span = sampled_root(&recorder);
        span.finish();
        span.set_label("late", "value");
        assert_eq!(span.label("late"), None);
    }

    #[test]
    fn unsampled_spans_are_not_reported() {
        let recorder = Arc::new(Recorder::default());
        let span = Span::new_root("root", TraceOptions::NONE, recorder.clone());
        assert!(span.finish());
        assert!(span.is_finished());
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn concurrent_finish_reports_once() {
        let recorder = Arc::new(Recorder::default());
        let span = sampled_root(&recorder);

        let finished: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let span = span.clone();
                    scope.spawn(move || span.finish())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().map(usize::from).unwrap_or(0))
                .sum()
        });

        assert_eq!(finished, 1);
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
