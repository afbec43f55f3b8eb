use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;

use pollbot_core::domain::poll::{NewPoll, Poll, PollId, PollOption, PollStatus};
use pollbot_core::errors::DomainError;

use super::{PollRepository, RepositoryError};
use crate::DbPool;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed gateway. Vote increments are single conditional `UPDATE`
/// statements, so concurrent voters never lose updates and an ended poll
/// never gains votes.
pub struct SqlPollRepository {
    pool: DbPool,
    operation_timeout: Duration,
}

impl SqlPollRepository {
    pub fn new(pool: DbPool) -> Self {
        Self::with_operation_timeout(pool, DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn with_operation_timeout(pool: DbPool, operation_timeout: Duration) -> Self {
        Self { pool, operation_timeout }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        tokio::time::timeout(self.operation_timeout, operation)
            .await
            .map_err(|_| RepositoryError::Timeout(self.operation_timeout))?
    }

    async fn insert_poll(&self, new_poll: NewPoll) -> Result<Poll, RepositoryError> {
        let poll = Poll::open(new_poll, Utc::now());
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO votes (id, creator, question, status, created_at, ended_at)
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(&poll.id.0)
        .bind(&poll.creator)
        .bind(&poll.question)
        .bind(poll.status.as_str())
        .bind(poll.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                return Err(RepositoryError::DuplicateId(poll.id.clone()));
            }
            Err(error) => return Err(error.into()),
        }

        for (position, option) in poll.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO vote_options (poll_id, position, label, vote_count)
                 VALUES (?, ?, ?, 0)",
            )
            .bind(&poll.id.0)
            .bind(position as i64)
            .bind(&option.label)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(poll)
    }

    async fn increment_option(&self, id: &PollId, option: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE vote_options SET vote_count = vote_count + 1
             WHERE poll_id = ? AND label = ?
               AND EXISTS (
                   SELECT 1 FROM votes
                   WHERE votes.id = vote_options.poll_id AND votes.status = 'active'
               )",
        )
        .bind(&id.0)
        .bind(option)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.load_status(id).await? {
            None => Err(RepositoryError::NotFound(id.clone())),
            Some(PollStatus::Ended) => Err(DomainError::PollEnded(id.clone()).into()),
            Some(PollStatus::Active) => Err(DomainError::UnknownOption(option.to_owned()).into()),
        }
    }

    async fn load_poll(&self, id: &PollId) -> Result<Option<Poll>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT v.id, v.creator, v.question, v.status, v.created_at, v.ended_at,
                    o.label, o.vote_count
             FROM votes v
             LEFT JOIN vote_options o ON o.poll_id = v.id
             WHERE v.id = ?
             ORDER BY o.position ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        decode_poll(&rows).map(Some)
    }

    async fn load_status(&self, id: &PollId) -> Result<Option<PollStatus>, RepositoryError> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM votes WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        status.map(|raw| decode_status(&raw)).transpose()
    }

    async fn mark_ended(&self, id: &PollId) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE votes SET status = 'ended', ended_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.load_status(id).await? {
            None => Err(RepositoryError::NotFound(id.clone())),
            Some(_) => Err(DomainError::AlreadyEnded(id.clone()).into()),
        }
    }

    async fn remove_poll(&self, id: &PollId) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("DELETE FROM votes WHERE id = ?").bind(&id.0).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.clone()));
        }
        Ok(())
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|error| RepositoryError::Schema(format!("column `{name}`: {error}")))
}

fn decode_status(raw: &str) -> Result<PollStatus, RepositoryError> {
    PollStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Schema(format!("unknown vote status `{raw}`")))
}

fn decode_timestamp(raw: &str, name: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Schema(format!("column `{name}` is not RFC 3339: {error}")))
}

fn decode_poll(rows: &[SqliteRow]) -> Result<Poll, RepositoryError> {
    let first = rows.first().ok_or_else(|| RepositoryError::Schema("empty row set".to_owned()))?;

    let id: String = column(first, "id")?;
    let creator: String = column(first, "creator")?;
    let question: String = column(first, "question")?;
    let status = decode_status(&column::<String>(first, "status")?)?;
    let created_at = decode_timestamp(&column::<String>(first, "created_at")?, "created_at")?;
    let ended_at = column::<Option<String>>(first, "ended_at")?
        .map(|raw| decode_timestamp(&raw, "ended_at"))
        .transpose()?;

    if (status == PollStatus::Ended) != ended_at.is_some() {
        return Err(RepositoryError::Schema(format!(
            "vote `{id}` has status `{}` but ended_at is {}",
            status.as_str(),
            if ended_at.is_some() { "set" } else { "missing" }
        )));
    }

    let mut options = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(label) = column::<Option<String>>(row, "label")? else {
            continue;
        };
        let raw_count: i64 = column(row, "vote_count")?;
        let votes = u64::try_from(raw_count).map_err(|_| {
            RepositoryError::Schema(format!("option `{label}` has negative count {raw_count}"))
        })?;
        options.push(PollOption { label, votes });
    }

    if options.is_empty() {
        return Err(RepositoryError::Schema(format!("vote `{id}` has no options")));
    }

    Ok(Poll { id: PollId(id), creator, question, options, status, created_at, ended_at })
}

#[async_trait::async_trait]
impl PollRepository for SqlPollRepository {
    async fn create_poll(&self, new_poll: NewPoll) -> Result<Poll, RepositoryError> {
        self.bounded(self.insert_poll(new_poll)).await
    }

    async fn record_vote(&self, id: &PollId, option: &str) -> Result<(), RepositoryError> {
        self.bounded(self.increment_option(id, option)).await
    }

    async fn get_results(&self, id: &PollId) -> Result<Option<Poll>, RepositoryError> {
        self.bounded(self.load_poll(id)).await
    }

    async fn end_poll(&self, id: &PollId) -> Result<(), RepositoryError> {
        self.bounded(self.mark_ended(id)).await
    }

    async fn delete_poll(&self, id: &PollId) -> Result<(), RepositoryError> {
        self.bounded(self.remove_poll(id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinSet;

    use pollbot_core::domain::poll::{NewPoll, PollId, PollStatus};
    use pollbot_core::errors::DomainError;

    use super::SqlPollRepository;
    use crate::repositories::{PollRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn repository() -> SqlPollRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlPollRepository::new(pool)
    }

    fn color_poll(id: &str) -> NewPoll {
        NewPoll::new(
            PollId(id.to_owned()),
            "U-creator",
            "Best color?",
            vec!["red".to_owned(), "blue".to_owned(), "green".to_owned()],
        )
        .expect("valid poll")
    }

    #[tokio::test]
    async fn create_then_read_back_in_creation_order() {
        let repo = repository().await;
        let created = repo.create_poll(color_poll("p1")).await.expect("create");
        assert_eq!(created.status, PollStatus::Active);

        let poll = repo.get_results(&created.id).await.expect("read").expect("poll exists");
        assert_eq!(poll.creator, "U-creator");
        assert_eq!(poll.question, "Best color?");
        assert_eq!(poll.option_labels(), vec!["red", "blue", "green"]);
        assert_eq!(poll.total_votes(), 0);
        assert_eq!(poll.ended_at, None);
    }

    #[tokio::test]
    async fn duplicate_id_fails_without_overwriting() {
        let repo = repository().await;
        repo.create_poll(color_poll("p1")).await.expect("create");

        let second = NewPoll::new(
            PollId("p1".to_owned()),
            "U-other",
            "Different question",
            vec!["yes".to_owned()],
        )
        .expect("valid poll");
        let error = repo.create_poll(second).await.expect_err("id is taken");
        assert!(matches!(error, RepositoryError::DuplicateId(ref id) if id.0 == "p1"));

        let poll = repo.get_results(&PollId("p1".to_owned())).await.expect("read").expect("poll");
        assert_eq!(poll.question, "Best color?");
        assert_eq!(poll.option_labels(), vec!["red", "blue", "green"]);
    }

    #[tokio::test]
    async fn votes_increment_only_the_chosen_option() {
        let repo = repository().await;
        let id = repo.create_poll(color_poll("p1")).await.expect("create").id;

        for _ in 0..4 {
            repo.record_vote(&id, "red").await.expect("vote red");
        }
        repo.record_vote(&id, "blue").await.expect("vote blue");

        let poll = repo.get_results(&id).await.expect("read").expect("poll");
        assert_eq!(poll.votes_for("red"), Some(4));
        assert_eq!(poll.votes_for("blue"), Some(1));
        assert_eq!(poll.votes_for("green"), Some(0));
        assert_eq!(poll.option_labels(), vec!["red", "blue", "green"]);
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_and_counts_are_unchanged() {
        let repo = repository().await;
        let id = repo.create_poll(color_poll("p1")).await.expect("create").id;
        repo.record_vote(&id, "red").await.expect("vote red");

        let error = repo.record_vote(&id, "purple").await.expect_err("purple is not an option");
        assert!(matches!(
            error,
            RepositoryError::Domain(DomainError::UnknownOption(ref option)) if option == "purple"
        ));

        let poll = repo.get_results(&id).await.expect("read").expect("poll");
        assert_eq!(poll.total_votes(), 1);
        assert_eq!(poll.options.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_votes_are_never_lost() {
        let repo = Arc::new(repository().await);
        let id = repo.create_poll(color_poll("p1")).await.expect("create").id;

        let mut voters = JoinSet::new();
        for _ in 0..40 {
            let repo = Arc::clone(&repo);
            let id = id.clone();
            voters.spawn(async move { repo.record_vote(&id, "green").await });
        }

        let mut succeeded = 0;
        while let Some(joined) = voters.join_next().await {
            joined.expect("voter task").expect("vote recorded");
            succeeded += 1;
        }

        let poll = repo.get_results(&id).await.expect("read").expect("poll");
        assert_eq!(succeeded, 40);
        assert_eq!(poll.votes_for("green"), Some(40));
        assert_eq!(poll.total_votes(), 40);
    }

    #[tokio::test]
    async fn ended_polls_reject_votes_and_second_end() {
        let repo = repository().await;
        let id = repo.create_poll(color_poll("p1")).await.expect("create").id;
        repo.record_vote(&id, "red").await.expect("vote red");
        repo.end_poll(&id).await.expect("end");

        let vote_error = repo.record_vote(&id, "blue").await.expect_err("poll is closed");
        assert!(matches!(vote_error, RepositoryError::Domain(DomainError::PollEnded(_))));

        let end_error = repo.end_poll(&id).await.expect_err("already ended");
        assert!(matches!(end_error, RepositoryError::Domain(DomainError::AlreadyEnded(_))));

        let poll = repo.get_results(&id).await.expect("read").expect("poll");
        assert_eq!(poll.status, PollStatus::Ended);
        assert!(poll.ended_at.is_some());
        assert_eq!(poll.votes_for("red"), Some(1));
        assert_eq!(poll.votes_for("blue"), Some(0));
    }

    #[tokio::test]
    async fn missing_polls_report_not_found() {
        let repo = repository().await;
        let missing = PollId("nope".to_owned());

        assert!(repo.get_results(&missing).await.expect("read").is_none());
        assert!(matches!(
            repo.record_vote(&missing, "red").await,
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(repo.end_poll(&missing).await, Err(RepositoryError::NotFound(_))));
        assert!(matches!(repo.delete_poll(&missing).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn deleted_polls_are_gone_for_good() {
        let repo = repository().await;
        let id = repo.create_poll(color_poll("p1")).await.expect("create").id;
        repo.record_vote(&id, "red").await.expect("vote");

        repo.delete_poll(&id).await.expect("delete");

        assert!(repo.get_results(&id).await.expect("read").is_none());
        assert!(matches!(repo.delete_poll(&id).await, Err(RepositoryError::NotFound(_))));

        let (orphans,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM vote_options WHERE poll_id = ?")
                .bind(&id.0)
                .fetch_one(repo.pool())
                .await
                .expect("count options");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn malformed_rows_fail_with_schema_error() {
        let repo = repository().await;
        sqlx::query(
            "INSERT INTO votes (id, creator, question, status, created_at)
             VALUES ('broken', 'U1', 'q', 'active', 'yesterday-ish')",
        )
        .execute(repo.pool())
        .await
        .expect("insert malformed poll");
        sqlx::query("INSERT INTO vote_options (poll_id, position, label) VALUES ('broken', 0, 'a')")
            .execute(repo.pool())
            .await
            .expect("insert option");

        let error = repo.get_results(&PollId("broken".to_owned())).await.expect_err("bad timestamp");
        assert!(matches!(error, RepositoryError::Schema(ref message) if message.contains("created_at")));
    }

    #[tokio::test]
    async fn hung_store_calls_time_out() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlPollRepository::with_operation_timeout(pool.clone(), Duration::from_millis(50));

        let held = pool.acquire().await.expect("hold the only connection");
        let error = repo.get_results(&PollId("p1".to_owned())).await.expect_err("pool is exhausted");
        assert!(matches!(error, RepositoryError::Timeout(_)));
        drop(held);

        assert!(repo.get_results(&PollId("p1".to_owned())).await.expect("read").is_none());
    }
}
