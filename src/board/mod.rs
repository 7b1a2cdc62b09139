//! Board domain — data model, transition rules, and HTTP routes.

pub mod model;
pub mod routes;
pub mod setup;
pub mod transition;

pub use model::{
    AgentPreference, AgentVariant, Board, BoardEvent, BoardState, Claim, Column, EventFilter,
    EventType, Priority, ReleaseOutcome, Run, RunFinalize, RunStatus, Ticket, TicketLock,
    Validation, WorkflowState, column_for_state,
};
pub use routes::board_routes;
pub use setup::{NewColumn, add_column, create_board, default_columns, load_board_state};
pub use transition::validate;
