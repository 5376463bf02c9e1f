//! Loan history and reporting service.
//!
//! Plain reads outside any transaction: they may trail an in-flight borrow
//! or return, and they never wait for a row lock.

use crate::{
    error::{AppError, AppResult},
    models::{book::MostBorrowedBook, ids::UserId, loan::LoanDetails},
    repository::Repository,
};

/// Report size when the caller gives none
pub const DEFAULT_MOST_BORROWED_LIMIT: i64 = 10;

#[derive(Clone)]
pub struct HistoryService {
    repository: Repository,
    max_report_limit: i64,
}

impl HistoryService {
    pub fn new(repository: Repository, max_report_limit: i64) -> Self {
        Self {
            repository,
            max_report_limit,
        }
    }

    /// Every loan of one borrower, newest first
    pub async fn my_history(&self, borrower_id: UserId) -> AppResult<Vec<LoanDetails>> {
        self.repository.loans_user_history(borrower_id).await
    }

    /// Every loan of every borrower, newest first
    pub async fn all_history(&self) -> AppResult<Vec<LoanDetails>> {
        self.repository.loans_all_history().await
    }

    /// Books ranked by how many times they were borrowed
    pub async fn most_borrowed(&self, limit: Option<i64>) -> AppResult<Vec<MostBorrowedBook>> {
        let limit = limit.unwrap_or(DEFAULT_MOST_BORROWED_LIMIT);
        if limit < 1 || limit > self.max_report_limit {
            return Err(AppError::InvalidArgument(format!(
                "limit must be between 1 and {}",
                self.max_report_limit
            )));
        }
        self.repository.loans_most_borrowed(limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;

    use super::*;
    use crate::{
        models::{
            ids::{BookId, LoanId},
            loan::{now, LoanBook, LoanState},
        },
        repository::MockLendingStore,
    };

    fn service(store: MockLendingStore) -> HistoryService {
        HistoryService::new(Repository::new(Arc::new(store)), 100)
    }

    fn entry(title: &str, count: i64) -> MostBorrowedBook {
        MostBorrowedBook {
            book_id: BookId::new(),
            title: title.to_string(),
            author: "Author".to_string(),
            borrow_count: count,
        }
    }

    #[tokio::test]
    async fn test_most_borrowed_defaults_to_ten() {
        let mut store = MockLendingStore::new();
        store
            .expect_most_borrowed()
            .with(eq(10))
            .times(1)
            .returning(|_| Ok(vec![entry("X", 6), entry("Y", 3)]));

        let report = service(store).most_borrowed(None).await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].title, "X");
        assert_eq!(report[0].borrow_count, 6);
    }

    #[tokio::test]
    async fn test_most_borrowed_passes_explicit_limit() {
        let mut store = MockLendingStore::new();
        store
            .expect_most_borrowed()
            .with(eq(3))
            .times(1)
            .returning(|_| Ok(vec![]));

        assert!(service(store).most_borrowed(Some(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_most_borrowed_rejects_bad_limits() {
        let mut store = MockLendingStore::new();
        store.expect_most_borrowed().never();
        let service = service(store);

        for limit in [0, -5, 101] {
            let err = service.most_borrowed(Some(limit)).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn test_my_history_queries_the_borrower() {
        let borrower = UserId::new();
        let row = LoanDetails {
            id: LoanId::new(),
            borrowed_at: now(),
            returned_at: None,
            state: LoanState::Open,
            book: LoanBook {
                id: BookId::new(),
                title: "Dune".to_string(),
            },
            borrower: None,
        };
        let expected = vec![row.clone()];

        let mut store = MockLendingStore::new();
        store
            .expect_user_history()
            .with(eq(borrower))
            .times(1)
            .returning(move |_| Ok(vec![row.clone()]));

        assert_eq!(service(store).my_history(borrower).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_all_history_propagates_store_errors() {
        let mut store = MockLendingStore::new();
        store
            .expect_all_history()
            .returning(|| Err(AppError::Transient("connection refused".to_string())));

        let err = service(store).all_history().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
