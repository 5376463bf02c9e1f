//! Book endpoints: inventory administration and the most-borrowed report

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, MostBorrowedBook, NewBook, UpdateQuantity},
        ids::BookId,
    },
    AppState,
};

use super::AuthenticatedUser;

/// Query parameters for the most-borrowed report
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MostBorrowedQuery {
    /// Number of books to return (default: 10)
    pub limit: Option<i64>,
}

/// Most borrowed books
#[utoipa::path(
    get,
    path = "/books/most-borrowed",
    tag = "books",
    security(("bearer_auth" = [])),
    params(MostBorrowedQuery),
    responses(
        (status = 200, description = "Books ranked by borrow count", body = Vec<MostBorrowedBook>),
        (status = 400, description = "Limit out of range")
    )
)]
pub async fn most_borrowed(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Query(query): Query<MostBorrowedQuery>,
) -> AppResult<Json<Vec<MostBorrowedBook>>> {
    let report = state.services.history.most_borrowed(query.limit).await?;
    Ok(Json(report))
}

/// Add a book to the catalog
#[utoipa::path(
    post,
    path = "/books",
    tag = "books",
    security(("bearer_auth" = [])),
    request_body = NewBook,
    responses(
        (status = 201, description = "Book created", body = Book),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Librarian or administrator required"),
        (status = 409, description = "ISBN already exists")
    )
)]
pub async fn create_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(new_book): Json<NewBook>,
) -> AppResult<(StatusCode, Json<Book>)> {
    claims.require_staff()?;

    let book = state.services.catalog.create_book(new_book).await?;
    Ok((StatusCode::CREATED, Json(book)))
}

/// Get book details
#[utoipa::path(
    get,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Book UUID")
    ),
    responses(
        (status = 200, description = "Book details", body = Book),
        (status = 404, description = "Book not found")
    )
)]
pub async fn get_book(
    State(state): State<AppState>,
    AuthenticatedUser(_claims): AuthenticatedUser,
    Path(id): Path<BookId>,
) -> AppResult<Json<Book>> {
    let book = state.services.catalog.get_book(id).await?;
    Ok(Json(book))
}

/// Change the number of copies the library owns
#[utoipa::path(
    put,
    path = "/books/{id}/quantity",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Book UUID")
    ),
    request_body = UpdateQuantity,
    responses(
        (status = 200, description = "Quantity updated", body = Book),
        (status = 400, description = "Quantity below the number of copies on loan"),
        (status = 403, description = "Librarian or administrator required"),
        (status = 404, description = "Book not found")
    )
)]
pub async fn update_quantity(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<BookId>,
    Json(data): Json<UpdateQuantity>,
) -> AppResult<Json<Book>> {
    claims.require_staff()?;
    data.validate().map_err(|e| AppError::InvalidArgument(e.to_string()))?;

    let book = state
        .services
        .catalog
        .update_total_quantity(id, data.total_quantity)
        .await?;
    Ok(Json(book))
}

/// Delete a book that was never borrowed
#[utoipa::path(
    delete,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Book UUID")
    ),
    responses(
        (status = 204, description = "Book deleted"),
        (status = 403, description = "Librarian or administrator required"),
        (status = 404, description = "Book not found"),
        (status = 409, description = "Book has borrowing records")
    )
)]
pub async fn delete_book(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<BookId>,
) -> AppResult<StatusCode> {
    claims.require_staff()?;

    state.services.catalog.delete_book(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
