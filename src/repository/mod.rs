//! Repository layer: the transactional store behind the lending core.
//!
//! A [`LendingStore`] opens [`LendingTx`] units of work. Inside a unit the
//! book row is the only thing locked; the lock lasts until the unit is
//! committed, rolled back or dropped. Dropping an unfinished unit rolls it
//! back.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{
        book::{Book, MostBorrowedBook},
        ids::{BookId, LoanId, UserId},
        loan::{LoanDetails, LoanRecord},
    },
};

/// One open transaction against the store
#[async_trait]
pub trait LendingTx: Send {
    /// Take the exclusive row lock on a book and read it. Blocks while another
    /// transaction holds the lock, up to the store's lock timeout.
    async fn lock_book(&mut self, id: BookId) -> AppResult<Option<Book>>;

    /// Write back a book whose row lock this transaction holds.
    async fn save_book(&mut self, book: &Book) -> AppResult<()>;

    async fn insert_book(&mut self, book: &Book) -> AppResult<()>;

    /// Delete a book whose row lock this transaction holds.
    async fn delete_book(&mut self, id: BookId) -> AppResult<()>;

    /// Loan records referencing the book, open or closed
    async fn count_loans_for_book(&mut self, id: BookId) -> AppResult<i64>;

    async fn find_open_loan(
        &mut self,
        book_id: BookId,
        borrower_id: UserId,
    ) -> AppResult<Option<LoanRecord>>;

    async fn find_open_loan_by_id(&mut self, id: LoanId) -> AppResult<Option<LoanRecord>>;

    async fn insert_loan(&mut self, loan: &LoanRecord) -> AppResult<()>;

    /// Write the closed record, provided the stored one is still open.
    /// Returns `false` when another transaction closed it first.
    async fn close_loan(&mut self, loan: &LoanRecord) -> AppResult<bool>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Transactional store plus its lock-free read side
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LendingStore: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn LendingTx>>;

    async fn get_book(&self, id: BookId) -> AppResult<Option<Book>>;

    /// Loans of one borrower, newest first, joined with the book
    async fn user_history(&self, borrower_id: UserId) -> AppResult<Vec<LoanDetails>>;

    /// All loans, newest first, joined with book and borrower
    async fn all_history(&self) -> AppResult<Vec<LoanDetails>>;

    /// Books by number of loans, descending, ties by book id
    async fn most_borrowed(&self, limit: i64) -> AppResult<Vec<MostBorrowedBook>>;

    /// Connectivity probe
    async fn ping(&self) -> AppResult<()>;
}

/// Main repository handle shared by the services
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn LendingStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn LendingStore>) -> Self {
        Self { store }
    }

    /// Repository over PostgreSQL
    pub fn postgres(pool: Pool<Postgres>, lock_timeout: std::time::Duration) -> Self {
        Self::new(Arc::new(postgres::PgLendingStore::new(pool, lock_timeout)))
    }

    /// Repository over an in-process store
    pub fn memory(store: memory::MemoryStore) -> Self {
        Self::new(Arc::new(store))
    }

    pub async fn begin(&self) -> AppResult<Box<dyn LendingTx>> {
        self.store.begin().await
    }

    pub async fn books_get_by_id(&self, id: BookId) -> AppResult<Option<Book>> {
        self.store.get_book(id).await
    }

    pub async fn loans_user_history(&self, borrower_id: UserId) -> AppResult<Vec<LoanDetails>> {
        self.store.user_history(borrower_id).await
    }

    pub async fn loans_all_history(&self) -> AppResult<Vec<LoanDetails>> {
        self.store.all_history().await
    }

    pub async fn loans_most_borrowed(&self, limit: i64) -> AppResult<Vec<MostBorrowedBook>> {
        self.store.most_borrowed(limit).await
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.store.ping().await
    }
}
