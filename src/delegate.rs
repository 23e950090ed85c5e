//! Ring event delegate and its serialized dispatch queue.
//!
//! All delegate invocations are funneled through a single-consumer channel,
//! so callbacks never run concurrently and never reenter vnode state. A
//! fault in user code is caught and logged; the sink continues.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_channel::Receiver;
use async_channel::Sender;

use crate::vnode::Vnode;

/// Callback sink for ring membership events. Implement the events you care
/// about; the rest default to no-ops.
pub trait Delegate: Send + Sync + 'static {
    fn new_predecessor(&self, _local: &Vnode, _remote: &Vnode, _old: Option<&Vnode>) {}
    fn leaving(&self, _local: &Vnode, _pred: Option<&Vnode>, _succ: Option<&Vnode>) {}
    fn predecessor_leaving(&self, _local: &Vnode, _remote: &Vnode) {}
    fn successor_leaving(&self, _local: &Vnode, _remote: &Vnode) {}
    fn shutdown(&self) {}
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle through which ring components enqueue delegate callbacks.
#[derive(Clone)]
pub struct DelegateHandle {
    delegate: Option<Arc<dyn Delegate>>,
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl DelegateHandle {
    pub fn new(delegate: Option<Arc<dyn Delegate>>) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { delegate, tx, rx }
    }

    /// Spawn the single consumer task. Without a configured delegate this is
    /// a no-op, as is every later [invoke](Self::invoke).
    pub fn start(&self) {
        if self.delegate.is_none() {
            return;
        }
        let rx = self.rx.clone();
        tokio::spawn(async move {
            while let Ok(job) = rx.recv().await {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!("caught a panic invoking a delegate function: {:?}", panic);
                }
            }
        });
    }

    /// Enqueue a callback on the delegate. Returns a completion receiver, or
    /// None when no delegate is configured. Never blocks the caller.
    pub fn invoke(
        &self,
        f: impl FnOnce(&dyn Delegate) + Send + 'static,
    ) -> Option<Receiver<()>> {
        let delegate = self.delegate.clone()?;
        let (done_tx, done_rx) = async_channel::bounded(1);
        let job: Job = Box::new(move || {
            f(delegate.as_ref());
            let _ = done_tx.try_send(());
        });
        if self.tx.try_send(job).is_err() {
            return None;
        }
        Some(done_rx)
    }

    /// Drain queued callbacks through a terminal `shutdown` marker, then
    /// close the channel.
    pub async fn stop(&self) {
        if let Some(done) = self.invoke(|d| d.shutdown()) {
            let _ = done.recv().await;
        }
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Delegate for Recorder {
        fn shutdown(&self) {
            self.events.lock().unwrap().push("shutdown".into());
        }
    }

    #[tokio::test]
    async fn test_callbacks_serialized_in_order() {
        let recorder = Arc::new(Recorder::default());
        let handle = DelegateHandle::new(Some(recorder.clone()));
        handle.start();

        for i in 0..4 {
            let rec = recorder.clone();
            let done = handle
                .invoke(move |_| rec.events.lock().unwrap().push(format!("event-{i}")))
                .unwrap();
            done.recv().await.unwrap();
        }
        handle.stop().await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["event-0", "event-1", "event-2", "event-3", "shutdown"]
        );
    }

    #[tokio::test]
    async fn test_panic_in_callback_does_not_kill_sink() {
        let recorder = Arc::new(Recorder::default());
        let handle = DelegateHandle::new(Some(recorder.clone()));
        handle.start();

        let _ = handle.invoke(|_| panic!("delegate fault"));
        handle.stop().await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(*events, vec!["shutdown"]);
    }

    #[tokio::test]
    async fn test_no_delegate_is_noop() {
        let handle = DelegateHandle::new(None);
        handle.start();
        assert!(handle.invoke(|d| d.shutdown()).is_none());
        handle.stop().await;
    }
}
