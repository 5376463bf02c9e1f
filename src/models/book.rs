//! Book model: the catalog entry and its inventory ledger.
//!
//! `total_quantity` is the number of copies owned, `available_quantity` the
//! number not currently on loan. Every ledger change is computed here as a
//! new value; the stores only ever write whole rows back.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use super::ids::BookId;
use crate::error::{AppError, AppResult};

/// Book row as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Book {
    pub id: BookId,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub publication_year: i32,
    pub cover_image_url: Option<String>,
    pub total_quantity: i32,
    pub available_quantity: i32,
}

impl Book {
    /// Copies currently out on loan
    pub fn borrowed_count(&self) -> i32 {
        self.total_quantity - self.available_quantity
    }

    /// `0 <= available <= total`
    pub fn check_ledger(&self) -> AppResult<()> {
        if self.available_quantity < 0 || self.available_quantity > self.total_quantity {
            return Err(AppError::Internal(format!(
                "Inventory ledger of book {} is inconsistent (available {}, total {})",
                self.id, self.available_quantity, self.total_quantity
            )));
        }
        Ok(())
    }

    /// Ledger after lending one copy out
    pub fn checkout(&self) -> AppResult<Book> {
        if self.available_quantity <= 0 {
            return Err(AppError::Unavailable(
                "Book is not available for borrowing".to_string(),
            ));
        }
        let next = Book {
            available_quantity: self.available_quantity - 1,
            ..self.clone()
        };
        next.check_ledger()?;
        Ok(next)
    }

    /// Ledger after one copy comes back
    pub fn checkin(&self) -> AppResult<Book> {
        let next = Book {
            available_quantity: self.available_quantity + 1,
            ..self.clone()
        };
        next.check_ledger()?;
        Ok(next)
    }

    /// Ledger after the catalog changes the number of copies owned.
    ///
    /// Copies on loan stay on loan, so the new total may not drop below
    /// [`Book::borrowed_count`]; the available count absorbs the difference.
    pub fn with_total_quantity(&self, new_total: i32) -> AppResult<Book> {
        if new_total < 0 {
            return Err(AppError::InvalidArgument(
                "Total quantity cannot be negative".to_string(),
            ));
        }
        let borrowed = self.borrowed_count();
        if new_total < borrowed {
            return Err(AppError::InvalidArgument(format!(
                "Total quantity cannot be less than the number of currently borrowed books ({})",
                borrowed
            )));
        }
        let next = Book {
            total_quantity: new_total,
            available_quantity: new_total - borrowed,
            ..self.clone()
        };
        next.check_ledger()?;
        Ok(next)
    }
}

/// Create book request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct NewBook {
    #[validate(length(min = 10, max = 17, message = "ISBN must be 10 to 17 characters"))]
    pub isbn: String,
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[validate(range(min = 0, max = 9999, message = "Invalid publication year"))]
    pub publication_year: i32,
    #[validate(url(message = "Invalid cover image URL"))]
    pub cover_image_url: Option<String>,
    #[validate(range(min = 0, message = "Total quantity cannot be negative"))]
    pub total_quantity: i32,
}

impl NewBook {
    /// A fresh ledger entry: every copy is on the shelf.
    pub fn into_book(self) -> Book {
        Book {
            id: BookId::new(),
            isbn: self.isbn,
            title: self.title,
            author: self.author,
            publication_year: self.publication_year,
            cover_image_url: self.cover_image_url,
            total_quantity: self.total_quantity,
            available_quantity: self.total_quantity,
        }
    }
}

/// Change of the number of copies owned
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateQuantity {
    #[validate(range(min = 0, message = "Total quantity cannot be negative"))]
    pub total_quantity: i32,
}

/// One line of the most-borrowed report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct MostBorrowedBook {
    pub book_id: BookId,
    pub title: String,
    pub author: String,
    /// Open and closed loans together
    pub borrow_count: i64,
}
