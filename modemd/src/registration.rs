use futures::{future::BoxFuture, FutureExt};
use std::future::Future;
use tracing::debug;

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Registrations made during startup, undone in reverse order.
#[derive(Default)]
pub struct Registrations {
    undo: Vec<(&'static str, Undo)>,
}

impl Registrations {
    pub fn push<F, Fut>(&mut self, what: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("registered {what}");
        self.undo.push((what, Box::new(move || undo().boxed())));
    }

    pub async fn unwind(&mut self) {
        while let Some((what, undo)) = self.undo.pop() {
            debug!("unregistering {what}");
            undo().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }
}
