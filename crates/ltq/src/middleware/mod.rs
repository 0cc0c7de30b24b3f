//! Ordered, nested wrappers around task execution.
//!
//! A Middleware is entered before the body runs and exited after, with the
//! body invoked in between. `M1` is outermost, `Mn` innermost. This is
//! expressed here as a `before`/`after` hook pair rather than a recursive
//! continuation: `before` runs in entry order and may short-circuit by
//! returning `Some(outcome)`, which skips all inner middlewares and the body;
//! `after` then runs, in reverse order, for exactly the middlewares whose
//! `before` ran — so exit is deterministic even when the body or an inner
//! layer errors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;
use crate::task::{Outcome, Task};

mod builtin;

pub use builtin::{MaxAge, MaxRate, MaxTries};

/// The default stack applied when a Worker or Task does not declare one.
pub fn default_stack() -> Vec<Arc<dyn Middleware>> {
    vec![Arc::new(MaxTries), Arc::new(MaxAge), Arc::new(MaxRate::new())]
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Runs before the next inner layer. Returning `Some` short-circuits:
    /// inner middlewares and the task body are never entered.
    async fn before(&self, _message: &mut Message, _task: &Task) -> Option<Outcome> {
        None
    }

    /// Runs after the next inner layer (or after `before` short-circuited),
    /// seeing whatever outcome resulted. May replace it.
    async fn after(&self, _message: &mut Message, _task: &Task, outcome: Outcome) -> Outcome {
        outcome
    }
}

/// Runs `middlewares` outermost-first around `task`'s body for `message`.
/// Always returns an Outcome; body errors are captured as `Outcome::Error`
/// rather than propagated, since exit (the `after` hooks) must still run.
pub async fn run_pipeline(middlewares: &[Arc<dyn Middleware>], message: &mut Message, task: &Task) -> Outcome {
    let mut entered: Vec<&Arc<dyn Middleware>> = Vec::with_capacity(middlewares.len());
    let mut short_circuit = None;

    for mw in middlewares {
        match mw.before(message, task).await {
            Some(outcome) => {
                short_circuit = Some(outcome);
                break;
            }
            None => entered.push(mw),
        }
    }

    let mut outcome = match short_circuit {
        Some(outcome) => outcome,
        None => match task.func().call(message.args.clone(), message.kwargs.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Error(format!("{err:#}")),
        },
    };

    for mw in entered.into_iter().rev() {
        outcome = mw.after(message, task, outcome).await;
    }

    outcome
}
