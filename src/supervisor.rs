//! Supervisors compose many lifecycles into one.
//!
//! A `Group` starts its named children concurrently and a `List` starts its
//! children one after the other. Both are lifecycles themselves, so they nest
//! into supervision trees of any depth. Every child is registered through a
//! holder that carries the policy flags the supervisor evaluates when that
//! child fails to start or exits:
//!
//! * `close_all_on_start_error`: a failed start tears down every sibling and
//!   fails the supervisor's own start with an `InterruptedError`.
//! * `close_all_on_exit` / `close_all_on_exit_error`: an exit (clean / with
//!   error) tears down every sibling and ends the supervisor with the child's
//!   own result.
//! * List only: `stop_start_on_start_error` keeps the children that are
//!   running already and skips the rest, `close_back_on_exit` /
//!   `close_back_on_exit_error` close only the children appended after the
//!   one that exited.
//!
//! Every flag defaults to `true`.

pub(crate) mod child;
mod group;
mod list;

pub use group::{Group, GroupHolder, GroupRef, GROUP_FIELD_NAME};
pub use list::{List, ListHolder, ListRef, LIST_FIELD_NAME};
