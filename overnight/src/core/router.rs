//! Hybrid-mode model routing.
//!
//! Routing is a pure function of the task position and text: no hidden state,
//! identical inputs always produce the identical model id. This keeps the
//! policy unit-testable as a lookup table.

use crate::core::task::Task;
use crate::core::types::ModelId;

/// Routing policy inputs that stay fixed for a whole run.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    /// Model for ordinary tasks (local runtime).
    pub local_model: ModelId,
    /// Higher-capability remote model for early and complex tasks.
    pub remote_model: ModelId,
    /// The first K tasks always route to the remote model.
    pub remote_first_k: usize,
    /// Whether hybrid routing is enabled at all.
    pub hybrid: bool,
}

/// Keywords that mark a task as complex enough for the remote model.
const COMPLEX_MARKERS: &[&str] = &[
    "setup",
    "set up",
    "architecture",
    "architectural",
    "complex",
    "design",
    "migrate",
    "migration",
    "security",
];

/// Select the model for the task at `index` (0-based).
pub fn select_model(index: usize, task: &Task, policy: &RoutePolicy) -> ModelId {
    if !policy.hybrid {
        return policy.local_model.clone();
    }
    if index < policy.remote_first_k {
        return policy.remote_model.clone();
    }
    if is_complex(&task.title, &task.prompt) {
        return policy.remote_model.clone();
    }
    policy.local_model.clone()
}

fn is_complex(title: &str, prompt: &str) -> bool {
    let text = format!("{} {}", title, prompt).to_lowercase();
    COMPLEX_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    fn policy(hybrid: bool) -> RoutePolicy {
        RoutePolicy {
            local_model: ModelId::from("ollama/qwen2.5-coder:3b"),
            remote_model: ModelId::from("gemini"),
            remote_first_k: 3,
            hybrid,
        }
    }

    #[test]
    fn hybrid_off_always_selects_local() {
        let task = Task::new(1, "Redesign the architecture", "big change");
        assert_eq!(
            select_model(0, &task, &policy(false)),
            ModelId::from("ollama/qwen2.5-coder:3b")
        );
    }

    #[test]
    fn first_k_tasks_route_remote() {
        let task = Task::new(1, "Rename a variable", "trivial");
        let p = policy(true);
        for index in 0..3 {
            assert_eq!(select_model(index, &task, &p), p.remote_model);
        }
        assert_eq!(select_model(3, &task, &p), p.local_model);
    }

    #[test]
    fn complex_tasks_route_remote_past_first_k() {
        let p = policy(true);
        let complex = Task::new(5, "Set up CI pipeline", "github actions");
        assert_eq!(select_model(7, &complex, &p), p.remote_model);

        let simple = Task::new(6, "Tweak a log message", "wording only");
        assert_eq!(select_model(7, &simple, &p), p.local_model);
    }

    #[test]
    fn selection_is_deterministic_for_identical_inputs() {
        let p = policy(true);
        let task = Task::new(2, "Improve error messages", "clarify output");
        let first = select_model(4, &task, &p);
        for _ in 0..10 {
            assert_eq!(select_model(4, &task, &p), first);
        }
    }
}
