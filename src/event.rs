//! Event sink: fire-and-forget mutation notifications dispatched to an
//! embedder-supplied sink. The vault never waits on the sink and swallows
//! its failures.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

/// The mutation that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMethod {
    Added,
    Updated,
    Touched,
    Deleted,
}

impl EventMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Touched => "touched",
            Self::Deleted => "deleted",
        }
    }
}

/// A mutation notification: the item affected and, for `updated`, the
/// canonically ordered list of fields that changed.
#[derive(Debug, Clone)]
pub struct Event {
    pub method: EventMethod,
    pub id: Uuid,
    pub fields: Option<Vec<&'static str>>,
}

/// Receives mutation notifications from a [`crate::vault::Vault`].
///
/// Implementations should not assume ordering relative to the mutation that
/// produced the event: the vault dispatches notifications after its own
/// transaction has already committed, on a detached task.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: Event);
}

/// Delivers `event` to `sink`, if one is configured, without ever blocking
/// the caller.
///
/// `Vault`'s public API is synchronous (see `vault.rs`), so this cannot
/// assume an enclosing Tokio runtime to spawn onto. When one is already
/// running (an embedder driving the vault from async code), the delivery is
/// spawned onto it. Otherwise a detached OS thread drives a throwaway
/// current-thread runtime just long enough to deliver this one event.
/// Either way the caller never awaits the result.
pub fn dispatch(sink: Option<&Arc<dyn EventSink>>, event: Event) {
    let Some(sink) = sink else { return };
    let sink = Arc::clone(sink);

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                sink.record(event).await;
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("building a throwaway runtime for event dispatch");
                rt.block_on(sink.record(event));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(EventMethod, Uuid)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn record(&self, event: Event) {
            self.events.lock().unwrap().push((event.method, event.id));
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_event_to_sink() {
        let recording = Arc::new(RecordingSink { events: Mutex::new(Vec::new()) });
        let sink: Arc<dyn EventSink> = recording.clone();
        let id = Uuid::new_v4();
        dispatch(Some(&sink), Event { method: EventMethod::Added, id, fields: None });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let events = recording.events.lock().unwrap();
        assert_eq!(*events, vec![(EventMethod::Added, id)]);
    }

    #[tokio::test]
    async fn dispatch_is_a_no_op_with_no_sink() {
        dispatch(None, Event { method: EventMethod::Deleted, id: Uuid::new_v4(), fields: None });
    }
}
