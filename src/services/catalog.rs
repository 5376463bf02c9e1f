//! Catalog service: the book operations that touch the inventory ledger

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, NewBook},
        ids::BookId,
    },
    repository::Repository,
    services::{finish, log_failure},
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
}

impl CatalogService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    /// Add a book with all of its copies available
    pub async fn create_book(&self, new_book: NewBook) -> AppResult<Book> {
        new_book
            .validate()
            .map_err(|e| AppError::InvalidArgument(e.to_string()))?;

        let book = new_book.into_book();
        let mut tx = self.repository.begin().await?;
        let result = tx.insert_book(&book).await;
        finish(tx, result).await.map_err(|err| {
            log_failure("create_book", &err);
            err
        })?;

        tracing::info!(book_id = %book.id, isbn = %book.isbn, "Book created");
        Ok(book)
    }

    pub async fn get_book(&self, id: BookId) -> AppResult<Book> {
        self.repository
            .books_get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with ID \"{}\" not found", id)))
    }

    /// Change the number of copies owned. Runs under the book row lock so it
    /// serializes with borrows and returns of the same book.
    pub async fn update_total_quantity(&self, id: BookId, new_total: i32) -> AppResult<Book> {
        let mut tx = self.repository.begin().await?;
        let result = async {
            let book = tx
                .lock_book(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Book with ID \"{}\" not found", id)))?;
            let updated = book.with_total_quantity(new_total)?;
            tx.save_book(&updated).await?;
            Ok::<_, AppError>(updated)
        }
        .await;

        let updated = finish(tx, result).await.map_err(|err| {
            log_failure("update_total_quantity", &err);
            err
        })?;

        tracing::info!(
            book_id = %id,
            total = updated.total_quantity,
            available = updated.available_quantity,
            "Book quantity updated"
        );
        Ok(updated)
    }

    /// Delete a book nobody ever borrowed. Loan records are permanent, so a
    /// book with any record, open or closed, stays.
    pub async fn delete_book(&self, id: BookId) -> AppResult<()> {
        let mut tx = self.repository.begin().await?;
        let result = async {
            tx.lock_book(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Book with ID \"{}\" not found", id)))?;

            let loans = tx.count_loans_for_book(id).await?;
            if loans > 0 {
                return Err(AppError::Conflict(format!(
                    "Book is referenced by {} borrowing record(s) and cannot be deleted",
                    loans
                )));
            }
            tx.delete_book(id).await
        }
        .await;

        finish(tx, result).await.map_err(|err| {
            log_failure("delete_book", &err);
            err
        })?;

        tracing::info!(book_id = %id, "Book deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        models::{
            ids::UserId,
            user::{Role, User},
        },
        repository::memory::MemoryStore,
        services::borrowing::BorrowingService,
    };

    fn setup() -> (MemoryStore, CatalogService, BorrowingService) {
        let store = MemoryStore::new(Duration::from_secs(5));
        let repository = Repository::memory(store.clone());
        (
            store,
            CatalogService::new(repository.clone()),
            BorrowingService::new(repository),
        )
    }

    fn new_book(isbn: &str, total: i32) -> NewBook {
        NewBook {
            isbn: isbn.to_string(),
            title: "Refactoring".to_string(),
            author: "Martin Fowler".to_string(),
            publication_year: 1999,
            cover_image_url: None,
            total_quantity: total,
        }
    }

    fn member(store: &MemoryStore) -> UserId {
        let user = User {
            id: UserId::new(),
            username: format!("m-{}", uuid::Uuid::new_v4()),
            role: Role::Member,
        };
        let id = user.id;
        store.add_user(user).unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_, catalog, _) = setup();
        let book = catalog.create_book(new_book("9780201485677", 4)).await.unwrap();
        assert_eq!(book.available_quantity, 4);
        assert_eq!(catalog.get_book(book.id).await.unwrap(), book);
    }

    #[tokio::test]
    async fn test_create_invalid_book() {
        let (store, catalog, _) = setup();
        let err = catalog.create_book(new_book("42", 1)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(store.books().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate_isbn() {
        let (_, catalog, _) = setup();
        catalog.create_book(new_book("9780201485677", 1)).await.unwrap();
        let err = catalog
            .create_book(new_book("9780201485677", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_get_missing_book() {
        let (_, catalog, _) = setup();
        assert!(matches!(
            catalog.get_book(BookId::new()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quantity_guard_on_fully_lent_book() {
        let (store, catalog, borrowing) = setup();
        let book = catalog.create_book(new_book("9780201485677", 2)).await.unwrap();
        borrowing.borrow(book.id, member(&store)).await.unwrap();
        borrowing.borrow(book.id, member(&store)).await.unwrap();

        let err = catalog.update_total_quantity(book.id, 1).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        let unchanged = catalog.get_book(book.id).await.unwrap();
        assert_eq!((unchanged.total_quantity, unchanged.available_quantity), (2, 0));

        let updated = catalog.update_total_quantity(book.id, 3).await.unwrap();
        assert_eq!((updated.total_quantity, updated.available_quantity), (3, 1));
        store.verify_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_quantity_update_missing_book() {
        let (_, catalog, _) = setup();
        assert!(matches!(
            catalog.update_total_quantity(BookId::new(), 3).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unborrowed_book() {
        let (store, catalog, _) = setup();
        let book = catalog.create_book(new_book("9780201485677", 2)).await.unwrap();
        catalog.delete_book(book.id).await.unwrap();
        assert!(store.books().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_book_with_history_is_refused() {
        let (store, catalog, borrowing) = setup();
        let book = catalog.create_book(new_book("9780201485677", 1)).await.unwrap();
        let borrower = member(&store);
        let loan = borrowing.borrow(book.id, borrower).await.unwrap();
        borrowing.return_loan(loan.id, borrower).await.unwrap();

        let err = catalog.delete_book(book.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.books().unwrap().len(), 1);
    }
}
