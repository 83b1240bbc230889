use engine_executors::{
    events::{EventEnvelope, EventKind, EventSink, TracingEventSink},
    webhook::WebhookEventSink,
};

/// Event sink picked from configuration at startup.
#[derive(Clone)]
pub enum DispatchSink {
    Tracing(TracingEventSink),
    Webhook(WebhookEventSink),
}

impl EventSink for DispatchSink {
    async fn notify(&self, kind: EventKind, payload: EventEnvelope) {
        match self {
            DispatchSink::Tracing(sink) => sink.notify(kind, payload).await,
            DispatchSink::Webhook(sink) => sink.notify(kind, payload).await,
        }
    }
}
