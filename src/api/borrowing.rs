//! Borrowing endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    error::AppResult,
    models::{
        ids::{BookId, LoanId},
        loan::{LoanDetails, LoanRecord},
    },
    AppState,
};

use super::AuthenticatedUser;

/// Borrow a book
#[utoipa::path(
    post,
    path = "/borrowing/borrow/{book_id}",
    tag = "borrowing",
    security(("bearer_auth" = [])),
    params(
        ("book_id" = String, Path, description = "Book UUID to borrow")
    ),
    responses(
        (status = 201, description = "Successfully borrowed the book", body = LoanRecord),
        (status = 403, description = "Caller is not a member"),
        (status = 404, description = "Book not found"),
        (status = 409, description = "Book is unavailable or already borrowed by the caller"),
        (status = 503, description = "Lock wait timed out, retry")
    )
)]
pub async fn borrow_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(book_id): Path<BookId>,
) -> AppResult<(StatusCode, Json<LoanRecord>)> {
    claims.require_member()?;

    let record = state
        .services
        .borrowing
        .borrow(book_id, claims.user_id())
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Return a borrowed book
#[utoipa::path(
    post,
    path = "/borrowing/return/{record_id}",
    tag = "borrowing",
    security(("bearer_auth" = [])),
    params(
        ("record_id" = String, Path, description = "Borrowing record UUID to return")
    ),
    responses(
        (status = 200, description = "Successfully returned the book", body = LoanRecord),
        (status = 403, description = "Record belongs to another borrower"),
        (status = 404, description = "Active borrowing record not found"),
        (status = 503, description = "Lock wait timed out, retry")
    )
)]
pub async fn return_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(record_id): Path<LoanId>,
) -> AppResult<Json<LoanRecord>> {
    claims.require_member()?;

    let record = state
        .services
        .borrowing
        .return_loan(record_id, claims.user_id())
        .await?;
    Ok(Json(record))
}

/// Borrowing history of the caller
#[utoipa::path(
    get,
    path = "/borrowing/history/me",
    tag = "borrowing",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Caller's borrowing history, newest first", body = Vec<LoanDetails>)
    )
)]
pub async fn my_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanDetails>>> {
    let history = state.services.history.my_history(claims.user_id()).await?;
    Ok(Json(history))
}

/// Borrowing history of every borrower
#[utoipa::path(
    get,
    path = "/borrowing/history/all",
    tag = "borrowing",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "All borrowing history, newest first", body = Vec<LoanDetails>),
        (status = 403, description = "Librarian or administrator required")
    )
)]
pub async fn all_history(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<LoanDetails>>> {
    claims.require_staff()?;

    let history = state.services.history.all_history().await?;
    Ok(Json(history))
}
