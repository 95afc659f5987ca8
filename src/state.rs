use crate::reconciler::Reconciler;
use crate::scope::OperationScope;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ControllerContext<S, R> {
    pub(crate) reconciler: Reconciler<S, R>,
    pub(crate) scope: OperationScope,
}

/// Readiness flag shared between the controllers and the health endpoint.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
