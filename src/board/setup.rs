//! Board creation and state loading.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{Board, BoardState, Column, WorkflowState};
use crate::error::DatabaseError;
use crate::store::Database;

/// Column to create on a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
}

impl NewColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wip_limit: None,
        }
    }
}

/// The six canonical columns in board order.
pub fn default_columns() -> Vec<NewColumn> {
    WorkflowState::ALL
        .iter()
        .map(|state| NewColumn::new(state.label()))
        .collect()
}

/// Create a board with `columns`, or the canonical six when empty.
pub async fn create_board(
    db: &dyn Database,
    name: &str,
    columns: Vec<NewColumn>,
) -> Result<BoardState, DatabaseError> {
    let columns = if columns.is_empty() {
        default_columns()
    } else {
        columns
    };

    let board = Board::new(name);
    db.create_board(&board).await?;

    let mut created = Vec::with_capacity(columns.len());
    for (position, spec) in columns.into_iter().enumerate() {
        let mut column = Column::new(board.id, spec.name, position as i32);
        column.wip_limit = spec.wip_limit;
        db.create_column(&column).await?;
        created.push(column);
    }

    Ok(BoardState {
        board,
        columns: created,
        tickets: Vec::new(),
    })
}

/// Append a column after the existing ones.
pub async fn add_column(
    db: &dyn Database,
    board_id: Uuid,
    spec: NewColumn,
) -> Result<Column, DatabaseError> {
    let existing = db.list_columns(board_id).await?;
    let position = existing.iter().map(|c| c.position + 1).max().unwrap_or(0);
    let mut column = Column::new(board_id, spec.name, position);
    column.wip_limit = spec.wip_limit;
    db.create_column(&column).await?;
    Ok(column)
}

/// Full authoritative state of one board, or `None` if it does not exist.
pub async fn load_board_state(
    db: &dyn Database,
    board_id: Uuid,
) -> Result<Option<BoardState>, DatabaseError> {
    let Some(board) = db.get_board(board_id).await? else {
        return Ok(None);
    };
    let columns = db.list_columns(board_id).await?;
    let tickets = db.list_tickets(board_id).await?;
    Ok(Some(BoardState {
        board,
        columns,
        tickets,
    }))
}
