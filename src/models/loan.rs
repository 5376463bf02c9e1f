//! Loan record model and related types

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::ids::{BookId, LoanId, UserId};
use crate::error::{AppError, AppResult};

/// Current time at the precision the store keeps (microseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle of a loan record. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoanState {
    Open,
    Closed,
}

/// Loan record from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LoanRecord {
    pub id: LoanId,
    pub book_id: BookId,
    pub borrower_id: UserId,
    pub borrowed_at: DateTime<Utc>,
    /// `None` while the loan is open
    pub returned_at: Option<DateTime<Utc>>,
}

impl LoanRecord {
    /// A new open loan
    pub fn open(book_id: BookId, borrower_id: UserId, at: DateTime<Utc>) -> Self {
        Self {
            id: LoanId::new(),
            book_id,
            borrower_id,
            borrowed_at: at,
            returned_at: None,
        }
    }

    pub fn state(&self) -> LoanState {
        match self.returned_at {
            None => LoanState::Open,
            Some(_) => LoanState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == LoanState::Open
    }

    /// The same loan, returned at `at`.
    ///
    /// The return stamp is kept strictly after `borrowed_at` even when both
    /// fall in the same microsecond.
    pub fn close(&self, at: DateTime<Utc>) -> AppResult<LoanRecord> {
        if !self.is_open() {
            return Err(AppError::NotFound(
                "Active borrowing record not found".to_string(),
            ));
        }
        let earliest = self.borrowed_at + Duration::microseconds(1);
        Ok(LoanRecord {
            returned_at: Some(at.max(earliest)),
            ..self.clone()
        })
    }
}

/// Book fields shown alongside a loan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoanBook {
    pub id: BookId,
    pub title: String,
}

/// Borrower fields shown alongside a loan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoanBorrower {
    pub id: UserId,
    pub username: String,
}

/// Loan record joined for display in history listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LoanDetails {
    pub id: LoanId,
    pub borrowed_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub state: LoanState,
    pub book: LoanBook,
    /// Only present in the all-borrowers history
    #[serde(skip_serializing_if = "Option::is_none")]
    pub borrower: Option<LoanBorrower>,
}

/// Flat history row as produced by the store joins
#[derive(Debug, Clone, FromRow)]
pub struct LoanHistoryRow {
    pub id: LoanId,
    pub borrowed_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub book_id: BookId,
    pub book_title: String,
    pub borrower_id: UserId,
    pub borrower_username: Option<String>,
}

impl From<LoanHistoryRow> for LoanDetails {
    fn from(row: LoanHistoryRow) -> Self {
        let borrower_id = row.borrower_id;
        Self {
            id: row.id,
            borrowed_at: row.borrowed_at,
            returned_at: row.returned_at,
            state: if row.returned_at.is_some() {
                LoanState::Closed
            } else {
                LoanState::Open
            },
            book: LoanBook {
                id: row.book_id,
                title: row.book_title,
            },
            borrower: row.borrower_username.map(|username| LoanBorrower {
                id: borrower_id,
                username,
            }),
        }
    }
}

/// Newest loans first; equal timestamps fall back to the id so the order is stable.
pub fn sort_newest_first(rows: &mut [LoanDetails]) {
    rows.sort_by(|a, b| {
        b.borrowed_at
            .cmp(&a.borrowed_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
