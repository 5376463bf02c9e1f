//! In-process store backing the test suites.
//!
//! Keeps committed rows in maps and gives every book row its own async lock,
//! the way a relational store keeps row locks. A transaction stages its
//! writes privately and publishes them at commit, re-checking the unique and
//! foreign-key constraints at that point. Row locks are released only after
//! the writes are visible. Dropping a transaction discards its writes.
//! Lock entries for missing or deleted books are dropped once unused.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::{LendingStore, LendingTx};
use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, MostBorrowedBook},
        ids::{BookId, LoanId, UserId},
        loan::{sort_newest_first, LoanBook, LoanBorrower, LoanDetails, LoanRecord, LoanState},
        user::User,
    },
};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    books: HashMap<BookId, Book>,
    loans: HashMap<LoanId, LoanRecord>,
}

struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<BookId, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

impl Inner {
    fn tables(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::Internal("memory store tables poisoned".to_string()))
    }

    fn row_lock(&self, id: BookId) -> AppResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| AppError::Internal("memory store lock table poisoned".to_string()))?;
        Ok(locks.entry(id).or_default().clone())
    }

    /// Release a row lock and drop its table entry, unless another
    /// transaction is already waiting on it.
    fn forget_row_lock(&self, id: BookId, guard: OwnedMutexGuard<()>) -> AppResult<()> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| AppError::Internal("memory store lock table poisoned".to_string()))?;
        // One reference in the table, one held by `guard`.
        if locks.get(&id).is_some_and(|row| Arc::strong_count(row) == 2) {
            locks.remove(&id);
        }
        drop(guard);
        Ok(())
    }
}

/// Cheaply cloneable handle; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }

    /// Register a user, as the identity provider would.
    pub fn add_user(&self, user: User) -> AppResult<()> {
        self.inner.tables()?.users.insert(user.id, user);
        Ok(())
    }

    /// Insert a book row as-is, bypassing the catalog.
    pub fn add_book(&self, book: Book) -> AppResult<()> {
        book.check_ledger()?;
        self.inner.tables()?.books.insert(book.id, book);
        Ok(())
    }

    pub fn books(&self) -> AppResult<Vec<Book>> {
        Ok(self.inner.tables()?.books.values().cloned().collect())
    }

    pub fn loans(&self) -> AppResult<Vec<LoanRecord>> {
        Ok(self.inner.tables()?.loans.values().cloned().collect())
    }

    /// Check that every ledger reconciles with the open loans, and that no
    /// borrower holds two open loans of one book.
    pub fn verify_invariants(&self) -> AppResult<()> {
        let tables = self.inner.tables()?;
        let mut open_per_book: HashMap<BookId, i64> = HashMap::new();
        let mut open_pairs = HashSet::new();

        for loan in tables.loans.values().filter(|l| l.is_open()) {
            *open_per_book.entry(loan.book_id).or_default() += 1;
            if !open_pairs.insert((loan.book_id, loan.borrower_id)) {
                return Err(AppError::Internal(format!(
                    "Borrower {} holds two open loans of book {}",
                    loan.borrower_id, loan.book_id
                )));
            }
        }

        for book in tables.books.values() {
            book.check_ledger()?;
            let open = open_per_book.get(&book.id).copied().unwrap_or(0);
            if i64::from(book.borrowed_count()) != open {
                return Err(AppError::Internal(format!(
                    "Book {} lends {} copies but has {} open loans",
                    book.id,
                    book.borrowed_count(),
                    open
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LendingStore for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn LendingTx>> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            locks: HashMap::new(),
            staged_books: HashMap::new(),
            staged_loans: HashMap::new(),
        }))
    }

    async fn get_book(&self, id: BookId) -> AppResult<Option<Book>> {
        Ok(self.inner.tables()?.books.get(&id).cloned())
    }

    async fn user_history(&self, borrower_id: UserId) -> AppResult<Vec<LoanDetails>> {
        let tables = self.inner.tables()?;
        let mut rows: Vec<LoanDetails> = tables
            .loans
            .values()
            .filter(|l| l.borrower_id == borrower_id)
            .filter_map(|l| details(&tables, l, false))
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn all_history(&self) -> AppResult<Vec<LoanDetails>> {
        let tables = self.inner.tables()?;
        let mut rows: Vec<LoanDetails> = tables
            .loans
            .values()
            .filter_map(|l| details(&tables, l, true))
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn most_borrowed(&self, limit: i64) -> AppResult<Vec<MostBorrowedBook>> {
        let tables = self.inner.tables()?;
        let mut counts: HashMap<BookId, i64> = HashMap::new();
        for loan in tables.loans.values() {
            *counts.entry(loan.book_id).or_default() += 1;
        }

        let mut rows: Vec<MostBorrowedBook> = counts
            .into_iter()
            .filter_map(|(book_id, borrow_count)| {
                tables.books.get(&book_id).map(|b| MostBorrowedBook {
                    book_id,
                    title: b.title.clone(),
                    author: b.author.clone(),
                    borrow_count,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.borrow_count
                .cmp(&a.borrow_count)
                .then_with(|| a.book_id.cmp(&b.book_id))
        });
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        self.inner.tables().map(|_| ())
    }
}

fn details(tables: &Tables, loan: &LoanRecord, with_borrower: bool) -> Option<LoanDetails> {
    let book = tables.books.get(&loan.book_id)?;
    let borrower = if with_borrower {
        let user = tables.users.get(&loan.borrower_id)?;
        Some(LoanBorrower {
            id: user.id,
            username: user.username.clone(),
        })
    } else {
        None
    };
    Some(LoanDetails {
        id: loan.id,
        borrowed_at: loan.borrowed_at,
        returned_at: loan.returned_at,
        state: loan.state(),
        book: LoanBook {
            id: book.id,
            title: book.title.clone(),
        },
        borrower,
    })
}

struct MemoryTx {
    inner: Arc<Inner>,
    locks: HashMap<BookId, OwnedMutexGuard<()>>,
    /// `None` marks a deleted row
    staged_books: HashMap<BookId, Option<Book>>,
    staged_loans: HashMap<LoanId, LoanRecord>,
}

impl MemoryTx {
    fn visible_book(&self, tables: &Tables, id: BookId) -> Option<Book> {
        match self.staged_books.get(&id) {
            Some(staged) => staged.clone(),
            None => tables.books.get(&id).cloned(),
        }
    }

    fn visible_loans(&self, tables: &Tables) -> Vec<LoanRecord> {
        let mut loans: Vec<LoanRecord> = tables
            .loans
            .values()
            .filter(|l| !self.staged_loans.contains_key(&l.id))
            .cloned()
            .collect();
        loans.extend(self.staged_loans.values().cloned());
        loans
    }

    fn require_lock(&self, id: BookId) -> AppResult<()> {
        if self.locks.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::Internal(format!("Book {} written without its row lock", id)))
        }
    }

    /// Constraint checks against the latest committed rows
    fn check_constraints(&self, tables: &Tables) -> AppResult<()> {
        for (id, staged) in &self.staged_books {
            if let Some(book) = staged {
                book.check_ledger()?;
                let isbn_taken = tables
                    .books
                    .values()
                    .any(|other| other.id != *id && other.isbn == book.isbn);
                if isbn_taken {
                    return Err(AppError::Conflict(format!(
                        "A book with ISBN {} already exists",
                        book.isbn
                    )));
                }
            }
        }

        for loan in self.staged_loans.values() {
            match tables.loans.get(&loan.id) {
                // insert
                None => {
                    let duplicate = tables.loans.values().any(|other| {
                        other.is_open()
                            && other.book_id == loan.book_id
                            && other.borrower_id == loan.borrower_id
                    });
                    if duplicate {
                        return Err(AppError::DuplicateLoan(
                            "You have already borrowed this book and not yet returned it"
                                .to_string(),
                        ));
                    }
                }
                // close
                Some(stored) if !stored.is_open() => {
                    return Err(AppError::NotFound(
                        "Active borrowing record not found".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LendingTx for MemoryTx {
    async fn lock_book(&mut self, id: BookId) -> AppResult<Option<Book>> {
        if self.locks.contains_key(&id) {
            let tables = self.inner.tables()?;
            return Ok(self.visible_book(&tables, id));
        }

        let row = self.inner.row_lock(id)?;
        let guard = tokio::time::timeout(self.inner.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| {
                AppError::Transient(format!("Timed out waiting for the lock on book {}", id))
            })?;

        let book = {
            let tables = self.inner.tables()?;
            self.visible_book(&tables, id)
        };
        match book {
            Some(book) => {
                self.locks.insert(id, guard);
                Ok(Some(book))
            }
            None => {
                self.inner.forget_row_lock(id, guard)?;
                Ok(None)
            }
        }
    }

    async fn save_book(&mut self, book: &Book) -> AppResult<()> {
        self.require_lock(book.id)?;
        let exists = {
            let tables = self.inner.tables()?;
            self.visible_book(&tables, book.id).is_some()
        };
        if !exists {
            return Err(AppError::Internal(format!("Book {} vanished while locked", book.id)));
        }
        self.staged_books.insert(book.id, Some(book.clone()));
        Ok(())
    }

    async fn insert_book(&mut self, book: &Book) -> AppResult<()> {
        let tables = self.inner.tables()?;
        if self.visible_book(&tables, book.id).is_some() {
            return Err(AppError::Conflict(format!("Book {} already exists", book.id)));
        }
        drop(tables);
        self.staged_books.insert(book.id, Some(book.clone()));
        Ok(())
    }

    async fn delete_book(&mut self, id: BookId) -> AppResult<()> {
        self.require_lock(id)?;
        let referenced = {
            let tables = self.inner.tables()?;
            self.visible_loans(&tables).iter().any(|l| l.book_id == id)
        };
        if referenced {
            return Err(AppError::Conflict("Book is referenced by loan records".to_string()));
        }
        self.staged_books.insert(id, None);
        Ok(())
    }

    async fn count_loans_for_book(&mut self, id: BookId) -> AppResult<i64> {
        let tables = self.inner.tables()?;
        let count = self
            .visible_loans(&tables)
            .iter()
            .filter(|l| l.book_id == id)
            .count();
        Ok(count as i64)
    }

    async fn find_open_loan(
        &mut self,
        book_id: BookId,
        borrower_id: UserId,
    ) -> AppResult<Option<LoanRecord>> {
        let tables = self.inner.tables()?;
        Ok(self
            .visible_loans(&tables)
            .into_iter()
            .find(|l| l.is_open() && l.book_id == book_id && l.borrower_id == borrower_id))
    }

    async fn find_open_loan_by_id(&mut self, id: LoanId) -> AppResult<Option<LoanRecord>> {
        let tables = self.inner.tables()?;
        let loan = match self.staged_loans.get(&id) {
            Some(staged) => Some(staged.clone()),
            None => tables.loans.get(&id).cloned(),
        };
        Ok(loan.filter(LoanRecord::is_open))
    }

    async fn insert_loan(&mut self, loan: &LoanRecord) -> AppResult<()> {
        {
            let tables = self.inner.tables()?;
            if !tables.users.contains_key(&loan.borrower_id) {
                return Err(AppError::NotFound(format!(
                    "Borrower {} not found",
                    loan.borrower_id
                )));
            }
            if self.visible_book(&tables, loan.book_id).is_none() {
                return Err(AppError::NotFound(format!("Book {} not found", loan.book_id)));
            }
            let duplicate = self.visible_loans(&tables).iter().any(|other| {
                other.is_open()
                    && other.book_id == loan.book_id
                    && other.borrower_id == loan.borrower_id
            });
            if duplicate {
                return Err(AppError::DuplicateLoan(
                    "You have already borrowed this book and not yet returned it".to_string(),
                ));
            }
        }
        self.staged_loans.insert(loan.id, loan.clone());
        Ok(())
    }

    async fn close_loan(&mut self, loan: &LoanRecord) -> AppResult<bool> {
        if loan.state() != LoanState::Closed {
            return Err(AppError::Internal(format!("Loan {} written back open", loan.id)));
        }
        let still_open = {
            let tables = self.inner.tables()?;
            let current = match self.staged_loans.get(&loan.id) {
                Some(staged) => Some(staged.clone()),
                None => tables.loans.get(&loan.id).cloned(),
            };
            current.map(|l| l.is_open()).unwrap_or(false)
        };
        if !still_open {
            return Ok(false);
        }
        self.staged_loans.insert(loan.id, loan.clone());
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let mut this = *self;
        {
            let mut tables = this.inner.tables()?;
            this.check_constraints(&tables)?;

            for (id, staged) in &this.staged_books {
                match staged {
                    Some(book) => {
                        tables.books.insert(*id, book.clone());
                    }
                    None => {
                        tables.books.remove(id);
                    }
                }
            }
            for (id, loan) in &this.staged_loans {
                tables.loans.insert(*id, loan.clone());
            }
        }

        // Writes are visible; only now let waiting transactions in.
        let deleted: Vec<BookId> = this
            .staged_books
            .iter()
            .filter(|(_, staged)| staged.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in deleted {
            if let Some(guard) = this.locks.remove(&id) {
                this.inner.forget_row_lock(id, guard)?;
            }
        }
        drop(this);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{loan::now, user::Role};

    fn store() -> MemoryStore {
        MemoryStore::new(Duration::from_millis(100))
    }

    fn seed(store: &MemoryStore, total: i32) -> (Book, User) {
        let book = Book {
            id: BookId::new(),
            isbn: format!("978{:010}", rand_suffix()),
            title: "The Pragmatic Programmer".to_string(),
            author: "Hunt & Thomas".to_string(),
            publication_year: 1999,
            cover_image_url: None,
            total_quantity: total,
            available_quantity: total,
        };
        let user = User {
            id: UserId::new(),
            username: "member01".to_string(),
            role: Role::Member,
        };
        store.add_book(book.clone()).unwrap();
        store.add_user(user.clone()).unwrap();
        (book, user)
    }

    fn rand_suffix() -> u32 {
        uuid::Uuid::new_v4().as_u128() as u32
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = store();
        let (book, _) = seed(&store, 3);

        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_book(book.id).await.unwrap().unwrap();
        tx.save_book(&locked.checkout().unwrap()).await.unwrap();

        assert_eq!(store.get_book(book.id).await.unwrap().unwrap().available_quantity, 3);
        tx.commit().await.unwrap();
        assert_eq!(store.get_book(book.id).await.unwrap().unwrap().available_quantity, 2);
    }

    #[tokio::test]
    async fn test_second_locker_waits_and_sees_commit() {
        let store = MemoryStore::new(Duration::from_secs(5));
        let (book, _) = seed(&store, 1);

        let mut first = store.begin().await.unwrap();
        let locked = first.lock_book(book.id).await.unwrap().unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                let seen = second.lock_book(book.id).await.unwrap().unwrap();
                second.rollback().await.unwrap();
                seen.available_quantity
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.save_book(&locked.checkout().unwrap()).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lock_wait_times_out_as_transient() {
        let store = store();
        let (book, _) = seed(&store, 1);

        let mut holder = store.begin().await.unwrap();
        holder.lock_book(book.id).await.unwrap();

        let mut other = store.begin().await.unwrap();
        let err = other.lock_book(book.id).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_lock_and_discards_writes() {
        let store = store();
        let (book, user) = seed(&store, 2);

        {
            let mut tx = store.begin().await.unwrap();
            let locked = tx.lock_book(book.id).await.unwrap().unwrap();
            tx.save_book(&locked.checkout().unwrap()).await.unwrap();
            tx.insert_loan(&LoanRecord::open(book.id, user.id, now()))
                .await
                .unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_book(book.id).await.unwrap().unwrap();
        assert_eq!(locked.available_quantity, 2);
        tx.rollback().await.unwrap();
        assert!(store.loans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_without_lock_is_rejected() {
        let store = store();
        let (book, _) = seed(&store, 1);

        let mut tx = store.begin().await.unwrap();
        let err = tx.save_book(&book.checkout().unwrap()).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn test_insert_loan_checks_borrower_and_duplicates() {
        let store = store();
        let (book, user) = seed(&store, 3);

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_loan(&LoanRecord::open(book.id, UserId::new(), now()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        tx.insert_loan(&LoanRecord::open(book.id, user.id, now()))
            .await
            .unwrap();
        let err = tx
            .insert_loan(&LoanRecord::open(book.id, user.id, now()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateLoan(_)));
    }

    #[tokio::test]
    async fn test_close_loan_only_once() {
        let store = store();
        let (book, user) = seed(&store, 1);
        let loan = LoanRecord::open(book.id, user.id, now());

        let mut tx = store.begin().await.unwrap();
        tx.insert_loan(&loan).await.unwrap();
        tx.commit().await.unwrap();

        let closed = loan.close(now()).unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(tx.close_loan(&closed).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.close_loan(&closed).await.unwrap());
        assert!(tx.find_open_loan_by_id(loan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_referenced_book_conflicts() {
        let store = store();
        let (book, user) = seed(&store, 1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_loan(&LoanRecord::open(book.id, user.id, now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_book(book.id).await.unwrap();
        assert!(matches!(
            tx.delete_book(book.id).await,
            Err(AppError::Conflict(_))
        ));
    }

    fn row_lock_count(store: &MemoryStore) -> usize {
        store.inner.row_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_locking_missing_books_leaves_no_row_locks() {
        let store = store();

        for _ in 0..1000 {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.lock_book(BookId::new()).await.unwrap().is_none());
            tx.rollback().await.unwrap();
        }
        assert_eq!(row_lock_count(&store), 0);
    }

    #[tokio::test]
    async fn test_deleted_book_row_lock_is_dropped() {
        let store = store();
        let (book, _) = seed(&store, 1);

        let mut tx = store.begin().await.unwrap();
        tx.lock_book(book.id).await.unwrap().unwrap();
        tx.delete_book(book.id).await.unwrap();
        assert_eq!(row_lock_count(&store), 1);
        tx.commit().await.unwrap();

        assert_eq!(row_lock_count(&store), 0);
        assert!(store.books().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_on_deleted_book_sees_nothing() {
        let store = MemoryStore::new(Duration::from_secs(5));
        let (book, _) = seed(&store, 1);

        let mut tx = store.begin().await.unwrap();
        tx.lock_book(book.id).await.unwrap().unwrap();
        tx.delete_book(book.id).await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let found = tx.lock_book(book.id).await.unwrap();
                tx.rollback().await.unwrap();
                found
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.commit().await.unwrap();

        assert!(waiter.await.unwrap().is_none());
        assert_eq!(row_lock_count(&store), 0);
    }

    #[tokio::test]
    async fn test_duplicate_isbn_rejected_at_commit() {
        let store = store();
        let (book, _) = seed(&store, 1);

        let copy = Book {
            id: BookId::new(),
            ..book.clone()
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_book(&copy).await.unwrap();
        assert!(matches!(tx.commit().await, Err(AppError::Conflict(_))));
        assert_eq!(store.books().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_most_borrowed_ties_broken_by_book_id() {
        let store = store();
        let (a, user) = seed(&store, 1);
        let (b, _) = seed(&store, 1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_loan(&LoanRecord::open(a.id, user.id, now()))
            .await
            .unwrap();
        tx.insert_loan(&LoanRecord::open(b.id, user.id, now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let report = store.most_borrowed(10).await.unwrap();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(report.iter().map(|r| r.book_id).collect::<Vec<_>>(), expected);

        assert_eq!(store.most_borrowed(1).await.unwrap().len(), 1);
    }
}
