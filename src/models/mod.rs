//! Data models for Shelfkeeper

pub mod book;
pub mod ids;
pub mod loan;
pub mod user;

// Re-export commonly used types
pub use book::{Book, MostBorrowedBook, NewBook};
pub use ids::{BookId, LoanId, UserId};
pub use loan::{LoanDetails, LoanRecord, LoanState};
pub use user::{Role, User, UserClaims};
