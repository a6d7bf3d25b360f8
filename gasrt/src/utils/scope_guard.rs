use std::marker::PhantomData;

/// Runs a closure when it goes out of scope, unless disarmed.
///
/// Used to undo partial initialization on early returns and panics.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken on drop or disarm, so the closure runs at most once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_unless_disarmed() {
        let runs = Cell::new(0);

        {
            let _guard = ScopeGuard::new(|| runs.set(runs.get() + 1));
        }
        assert_eq!(runs.get(), 1);

        {
            let mut guard = ScopeGuard::new(|| runs.set(runs.get() + 1));
            guard.disarm();
        }
        assert_eq!(runs.get(), 1);
    }
}
