//! Commit-message to task matching.
//!
//! A task matches when the lowercased commit message contains the lowercased
//! task title as a substring. The first match in slice order wins — callers
//! pass tasks in the store's stable query order, which makes the tie-break
//! deterministic. No scoring, no "best" match.

use crate::models::Task;

/// Find the first open task whose title is referenced by `message`.
///
/// Empty or all-whitespace titles never match; without that guard an empty
/// title would trivially be contained in every message.
pub fn find_match<'a>(tasks: &'a [Task], message: &str) -> Option<&'a Task> {
    let message = message.to_lowercase();
    tasks
        .iter()
        .filter(|task| !task.title.trim().is_empty())
        .find(|task| message.contains(&task.title.to_lowercase()))
}
