#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        sync::atomic::{AtomicBool, AtomicU32, Ordering, fence},
        thread,
    };
    use std::sync::Arc;

    pub(crate) type Shared<'a, T> = Arc<T>;

    pub(crate) fn share<T>(arc: &Arc<T>) -> Shared<'_, T> {
        Arc::clone(arc)
    }

    pub(crate) fn join(lhs: impl FnOnce() + Send + 'static, rhs: impl FnOnce() + Send + 'static) {
        let lhs = thread::spawn(lhs);
        let rhs = thread::spawn(rhs);
        lhs.join().unwrap();
        rhs.join().unwrap();
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};
    use std::sync::Arc;

    pub(crate) type Shared<'a, T> = &'a T;

    pub(crate) fn share<T>(arc: &Arc<T>) -> Shared<'_, T> {
        arc
    }

    pub(crate) fn join(lhs: impl FnOnce() + Send, rhs: impl FnOnce() + Send) {
        rayon::join(lhs, rhs);
    }
}

pub(crate) use imp::*;
