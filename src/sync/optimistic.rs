//! Optimistic local mutations.
//!
//! A [`PendingMutation`] snapshots state, applies a speculative change, and
//! either commits (drops the snapshot) or rolls back to it. The cache is last
//! write wins, so a rollback also discards anything applied in between.

use parking_lot::Mutex;
use std::future::Future;

/// Speculative change awaiting confirmation
#[must_use = "a pending mutation must be committed or rolled back"]
pub struct PendingMutation<T: Clone> {
    previous: T,
}

impl<T: Clone> PendingMutation<T> {
    /// Snapshot `state`, then apply `change` to it
    pub fn begin(state: &mut T, change: impl FnOnce(&mut T)) -> Self {
        let previous = state.clone();
        change(state);
        Self { previous }
    }

    /// State as it was before the change
    pub fn previous(&self) -> &T {
        &self.previous
    }

    pub fn commit(self) {}

    pub fn rollback(self, state: &mut T) {
        *state = self.previous;
    }
}

/// Apply `change` under the lock, await `request`, and roll back if it fails.
/// `on_change` runs after the speculative apply and again after a rollback.
pub async fn run_optimistic<T, R, E, Fut>(
    state: &Mutex<T>,
    change: impl FnOnce(&mut T),
    request: Fut,
    on_change: impl Fn(&T),
) -> Result<R, E>
where
    T: Clone,
    Fut: Future<Output = Result<R, E>>,
{
    let pending = {
        let mut guard = state.lock();
        let pending = PendingMutation::begin(&mut *guard, change);
        on_change(&*guard);
        pending
    };

    match request.await {
        Ok(value) => {
            pending.commit();
            Ok(value)
        }
        Err(err) => {
            let mut guard = state.lock();
            pending.rollback(&mut *guard);
            on_change(&*guard);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_begin_and_rollback() {
        let mut notes = vec!["a".to_string()];
        let pending = PendingMutation::begin(&mut notes, |n| n.push("b".to_string()));
        assert_eq!(notes.len(), 2);
        assert_eq!(pending.previous().len(), 1);

        pending.rollback(&mut notes);
        assert_eq!(notes, vec!["a".to_string()]);
    }

    #[test]
    fn test_commit_keeps_change() {
        let mut count = 1;
        PendingMutation::begin(&mut count, |c| *c += 1).commit();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_run_optimistic_rolls_back_on_failure() {
        let state = Mutex::new(vec![1, 2]);
        let notified = AtomicUsize::new(0);

        let result: Result<(), &str> = run_optimistic(
            &state,
            |v| v.retain(|x| *x != 2),
            async {
                assert_eq!(*state.lock(), vec![1]);
                Err("rejected")
            },
            |_| {
                notified.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(*state.lock(), vec![1, 2]);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_optimistic_commits_on_success() {
        let state = Mutex::new(Vec::<i32>::new());
        let result: Result<i32, ()> = run_optimistic(&state, |v| v.push(7), async { Ok(7) }, |_| {}).await;

        assert_eq!(result, Ok(7));
        assert_eq!(*state.lock(), vec![7]);
    }
}
