use std::sync::Arc;

use parking_lot::Mutex;

use crate::header::TraceOptions;
use crate::session::Tracer;
use crate::span::{FinishedSpan, Reporter};

/// Keeps every reported span.
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<Vec<FinishedSpan>>>);

impl Recorder {
    pub(crate) fn spans(&self) -> Vec<FinishedSpan> {
        self.0.lock().clone()
    }
}

impl Reporter for Recorder {
    fn report(&self, span: FinishedSpan) {
        self.0.lock().push(span);
    }
}

/// A sampling tracer and the recorder it reports into.
pub(crate) fn recording_tracer() -> (Tracer, Recorder) {
    let recorder = Recorder::default();
    (Tracer::new(recorder.clone(), TraceOptions::SAMPLED), recorder)
}
