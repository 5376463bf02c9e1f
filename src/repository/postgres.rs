//! PostgreSQL store.
//!
//! Transactions run at READ COMMITTED. The book row is locked with
//! `SELECT ... FOR UPDATE`, so a second writer on the same book waits and
//! then reads the committed row. `lock_timeout` bounds the wait.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Transaction};

use super::{LendingStore, LendingTx};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, MostBorrowedBook},
        ids::{BookId, LoanId, UserId},
        loan::{LoanDetails, LoanHistoryRow, LoanRecord},
    },
};

const BOOK_COLUMNS: &str = "id, isbn, title, author, publication_year, cover_image_url, \
                            total_quantity, available_quantity";

const LOAN_COLUMNS: &str = "id, book_id, borrower_id, borrowed_at, returned_at";

#[derive(Clone)]
pub struct PgLendingStore {
    pool: Pool<Postgres>,
    lock_timeout: Duration,
}

impl PgLendingStore {
    pub fn new(pool: Pool<Postgres>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl LendingStore for PgLendingStore {
    async fn begin(&self) -> AppResult<Box<dyn LendingTx>> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters; the value is an integer we produced.
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&statement).execute(&mut *tx).await?;

        Ok(Box::new(PgLendingTx { tx }))
    }

    async fn get_book(&self, id: BookId) -> AppResult<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "SELECT {} FROM books WHERE id = $1",
            BOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(book)
    }

    async fn user_history(&self, borrower_id: UserId) -> AppResult<Vec<LoanDetails>> {
        let rows = sqlx::query_as::<_, LoanHistoryRow>(
            r#"
            SELECT l.id, l.borrowed_at, l.returned_at,
                   b.id AS book_id, b.title AS book_title,
                   l.borrower_id, NULL::text AS borrower_username
            FROM loan_records l
            JOIN books b ON b.id = l.book_id
            WHERE l.borrower_id = $1
            ORDER BY l.borrowed_at DESC, l.id DESC
            "#,
        )
        .bind(borrower_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LoanDetails::from).collect())
    }

    async fn all_history(&self) -> AppResult<Vec<LoanDetails>> {
        let rows = sqlx::query_as::<_, LoanHistoryRow>(
            r#"
            SELECT l.id, l.borrowed_at, l.returned_at,
                   b.id AS book_id, b.title AS book_title,
                   l.borrower_id, u.username AS borrower_username
            FROM loan_records l
            JOIN books b ON b.id = l.book_id
            JOIN users u ON u.id = l.borrower_id
            ORDER BY l.borrowed_at DESC, l.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LoanDetails::from).collect())
    }

    async fn most_borrowed(&self, limit: i64) -> AppResult<Vec<MostBorrowedBook>> {
        let rows = sqlx::query_as::<_, MostBorrowedBook>(
            r#"
            SELECT b.id AS book_id, b.title, b.author, COUNT(l.id) AS borrow_count
            FROM books b
            JOIN loan_records l ON l.book_id = b.id
            GROUP BY b.id, b.title, b.author
            ORDER BY borrow_count DESC, b.id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub struct PgLendingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LendingTx for PgLendingTx {
    async fn lock_book(&mut self, id: BookId) -> AppResult<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(&format!(
            "SELECT {} FROM books WHERE id = $1 FOR UPDATE",
            BOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(book)
    }

    async fn save_book(&mut self, book: &Book) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE books
            SET isbn = $2, title = $3, author = $4, publication_year = $5,
                cover_image_url = $6, total_quantity = $7, available_quantity = $8
            WHERE id = $1
            "#,
        )
        .bind(book.id)
        .bind(&book.isbn)
        .bind(&book.title)
        .bind(&book.author)
        .bind(book.publication_year)
        .bind(&book.cover_image_url)
        .bind(book.total_quantity)
        .bind(book.available_quantity)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(AppError::Internal(format!("Book {} vanished while locked", book.id)));
        }
        Ok(())
    }

    async fn insert_book(&mut self, book: &Book) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO books (id, isbn, title, author, publication_year,
                               cover_image_url, total_quantity, available_quantity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(book.id)
        .bind(&book.isbn)
        .bind(&book.title)
        .bind(&book.author)
        .bind(book.publication_year)
        .bind(&book.cover_image_url)
        .bind(book.total_quantity)
        .bind(book.available_quantity)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(AppError::Conflict(
                format!("A book with ISBN {} already exists", book.isbn),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_book(&mut self, id: BookId) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => Err(
                AppError::Conflict("Book is referenced by loan records".to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn count_loans_for_book(&mut self, id: BookId) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM loan_records WHERE book_id = $1")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    async fn find_open_loan(
        &mut self,
        book_id: BookId,
        borrower_id: UserId,
    ) -> AppResult<Option<LoanRecord>> {
        let loan = sqlx::query_as::<_, LoanRecord>(&format!(
            "SELECT {} FROM loan_records \
             WHERE book_id = $1 AND borrower_id = $2 AND returned_at IS NULL",
            LOAN_COLUMNS
        ))
        .bind(book_id)
        .bind(borrower_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(loan)
    }

    async fn find_open_loan_by_id(&mut self, id: LoanId) -> AppResult<Option<LoanRecord>> {
        let loan = sqlx::query_as::<_, LoanRecord>(&format!(
            "SELECT {} FROM loan_records WHERE id = $1 AND returned_at IS NULL",
            LOAN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(loan)
    }

    async fn insert_loan(&mut self, loan: &LoanRecord) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO loan_records (id, book_id, borrower_id, borrowed_at, returned_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(loan.id)
        .bind(loan.book_id)
        .bind(loan.borrower_id)
        .bind(loan.borrowed_at)
        .bind(loan.returned_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => Err(
                AppError::NotFound(format!("Borrower {} not found", loan.borrower_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn close_loan(&mut self, loan: &LoanRecord) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE loan_records SET returned_at = $2 WHERE id = $1 AND returned_at IS NULL",
        )
        .bind(loan.id)
        .bind(loan.returned_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
