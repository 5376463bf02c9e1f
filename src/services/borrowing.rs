//! Borrowing service: borrow and return as single transactions.
//!
//! The book row lock taken through [`LendingTx::lock_book`] is the only
//! serialization point. Everything a call decides is decided after that lock
//! is held, so a caller blocked behind another borrow of the same book sees
//! the ledger as the other call left it.

use crate::{
    error::{AppError, AppResult},
    models::{
        ids::{BookId, LoanId, UserId},
        loan::{now, LoanRecord},
    },
    repository::{LendingTx, Repository},
    services::{finish, log_failure},
};

#[derive(Clone)]
pub struct BorrowingService {
    repository: Repository,
}

impl BorrowingService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    /// Lend one copy of a book to a borrower
    pub async fn borrow(&self, book_id: BookId, borrower_id: UserId) -> AppResult<LoanRecord> {
        let mut tx = self.repository.begin().await?;
        let result = borrow_in(tx.as_mut(), book_id, borrower_id).await;

        match finish(tx, result).await {
            Ok(record) => {
                tracing::info!(
                    %book_id, %borrower_id, loan_id = %record.id,
                    "Book borrowed"
                );
                Ok(record)
            }
            Err(err) => {
                log_failure("borrow", &err);
                Err(err)
            }
        }
    }

    /// Close one of the borrower's own open loans
    pub async fn return_loan(&self, loan_id: LoanId, borrower_id: UserId) -> AppResult<LoanRecord> {
        let mut tx = self.repository.begin().await?;
        let result = return_in(tx.as_mut(), loan_id, borrower_id).await;

        match finish(tx, result).await {
            Ok(record) => {
                tracing::info!(
                    %loan_id, %borrower_id, book_id = %record.book_id,
                    "Book returned"
                );
                Ok(record)
            }
            Err(err) => {
                log_failure("return", &err);
                Err(err)
            }
        }
    }
}

async fn borrow_in(
    tx: &mut dyn LendingTx,
    book_id: BookId,
    borrower_id: UserId,
) -> AppResult<LoanRecord> {
    let book = tx
        .lock_book(book_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Book not found".to_string()))?;

    let lent = book.checkout()?;

    if tx.find_open_loan(book_id, borrower_id).await?.is_some() {
        return Err(AppError::DuplicateLoan(
            "You have already borrowed this book and not yet returned it".to_string(),
        ));
    }

    tx.save_book(&lent).await?;

    let record = LoanRecord::open(book_id, borrower_id, now());
    tx.insert_loan(&record).await?;
    Ok(record)
}

async fn return_in(
    tx: &mut dyn LendingTx,
    loan_id: LoanId,
    borrower_id: UserId,
) -> AppResult<LoanRecord> {
    // Looked up before the book lock: a bad id fails without contending.
    let record = tx
        .find_open_loan_by_id(loan_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Active borrowing record not found".to_string()))?;

    if record.borrower_id != borrower_id {
        return Err(AppError::Forbidden(
            "You cannot return a book you did not borrow".to_string(),
        ));
    }

    let book = tx.lock_book(record.book_id).await?.ok_or_else(|| {
        tracing::error!(
            %loan_id, book_id = %record.book_id,
            "Open loan references a missing book"
        );
        AppError::NotFound(format!(
            "The book associated with this record (ID: {}) could not be found",
            record.book_id
        ))
    })?;

    // Another return of the same record may have committed while we waited for the lock.
    if tx.find_open_loan_by_id(loan_id).await?.is_none() {
        return Err(AppError::NotFound(
            "Active borrowing record not found".to_string(),
        ));
    }

    tx.save_book(&book.checkin()?).await?;

    let closed = record.close(now())?;
    if !tx.close_loan(&closed).await? {
        return Err(AppError::NotFound(
            "Active borrowing record not found".to_string(),
        ));
    }
    Ok(closed)
}
