//! Phase execution engine.
//!
//! ## Module Map
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | `ExecutionState`, `ItemState`, options and statuses     |
//! | `plan`       | Per-item step plan and transition rules                 |
//! | `store`      | `StateStore` trait and the SQLite implementation        |
//! | `events`     | `ExecutionEvent` and the broadcast fan-out              |
//! | `registry`   | `ActiveRunRegistry`, the single tracked run             |
//! | `controller` | `ExecutionController`: run state machine + control loop |

pub mod controller;
pub mod events;
pub mod models;
pub mod plan;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod fakes;

pub use controller::{ControllerSettings, ExecutionController};
pub use events::{EventBroadcaster, ExecutionEvent};
pub use models::{
    ExecutionConfig, ExecutionOptions, ExecutionState, ExecutionStatus, ItemState, ItemStatus,
    WorkItem,
};
pub use store::{SqliteStateStore, StateStore};
