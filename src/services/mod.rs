//! Business logic services

pub mod borrowing;
pub mod catalog;
pub mod history;

use crate::{
    config::LendingConfig,
    error::{AppError, AppResult},
    repository::{LendingTx, Repository},
};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub borrowing: borrowing::BorrowingService,
    pub history: history::HistoryService,
    pub catalog: catalog::CatalogService,
    repository: Repository,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(repository: Repository, lending: &LendingConfig) -> Self {
        Self {
            borrowing: borrowing::BorrowingService::new(repository.clone()),
            history: history::HistoryService::new(repository.clone(), lending.max_report_limit),
            catalog: catalog::CatalogService::new(repository.clone()),
            repository,
        }
    }

    /// Store connectivity, for readiness probes
    pub async fn ready(&self) -> AppResult<()> {
        self.repository.ping().await
    }
}

/// Commit when the unit of work succeeded, roll back otherwise.
///
/// A failed commit is returned as is: the store has already discarded the
/// transaction by then.
pub(crate) async fn finish<T>(tx: Box<dyn LendingTx>, result: AppResult<T>) -> AppResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!("Rollback failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

/// Rejections and transient failures are `warn`, anything else is `error`.
pub(crate) fn failure_level(err: &AppError) -> tracing::Level {
    match err {
        AppError::NotFound(_)
        | AppError::Unavailable(_)
        | AppError::DuplicateLoan(_)
        | AppError::Forbidden(_)
        | AppError::InvalidArgument(_)
        | AppError::Conflict(_)
        | AppError::Authentication(_)
        | AppError::Transient(_) => tracing::Level::WARN,
        AppError::Database(_) | AppError::Internal(_) => tracing::Level::ERROR,
    }
}

pub(crate) fn log_failure(operation: &str, err: &AppError) {
    if failure_level(err) == tracing::Level::WARN {
        tracing::warn!(operation, error = %err, "Rejected, rolled back");
    } else {
        tracing::error!(operation, error = ?err, "Unexpected failure, rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_levels() {
        let rejections = [
            AppError::NotFound("x".to_string()),
            AppError::Unavailable("x".to_string()),
            AppError::DuplicateLoan("x".to_string()),
            AppError::Forbidden("x".to_string()),
            AppError::InvalidArgument("x".to_string()),
            AppError::Conflict("x".to_string()),
            AppError::Transient("x".to_string()),
        ];
        for err in &rejections {
            assert_eq!(failure_level(err), tracing::Level::WARN, "{:?}", err);
        }

        assert_eq!(
            failure_level(&AppError::Internal("x".to_string())),
            tracing::Level::ERROR
        );
        assert_eq!(
            failure_level(&AppError::Database(sqlx::Error::RowNotFound)),
            tracing::Level::ERROR
        );
    }
}
