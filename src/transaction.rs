//! In-memory transaction for the in-memory store backends.
//!
//! Mirrors the behavior of a database transaction closely enough for tests
//! and local pipelines: writes staged with [`on_commit`] become visible on
//! [`commit`], and undo actions registered with [`on_rollback`] run when the
//! transaction is rolled back or dropped without committing.
//!
//! [`on_commit`]: InMemoryTransaction::on_commit
//! [`on_rollback`]: InMemoryTransaction::on_rollback
//! [`commit`]: InMemoryTransaction::commit

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct InMemoryTransaction {
    on_commit: Vec<Action>,
    on_rollback: Vec<Action>,
}

impl InMemoryTransaction {
    pub fn begin() -> Self {
        Self::default()
    }

    pub(crate) fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    pub(crate) fn on_rollback(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_rollback.push(Box::new(action));
    }

    pub fn commit(mut self) {
        self.on_rollback.clear();
        for action in self.on_commit.drain(..) {
            action();
        }
    }

    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.on_commit.clear();
        for action in self.on_rollback.drain(..).rev() {
            action();
        }
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("staged", &self.on_commit.len())
            .finish()
    }
}
