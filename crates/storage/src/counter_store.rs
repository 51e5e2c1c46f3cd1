use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{ColumnTrait, EntityTrait, Set};
use visitproof_domain::storage::{CounterStore, StorageError, StorageResult, WindowCount};

use crate::entity::rate_limit_counters;
use crate::{update_returning_one, SeaOrmStorage};

/// Fixed-window counter. The increment, the fresh insert and the reset of an
/// expired window are each a single atomic statement, so concurrent callers
/// agree on one count per window. Two passes are enough: a pass only fails
/// when another caller changed the window shape, and that caller left a row
/// the next pass can hit.
#[async_trait::async_trait]
impl CounterStore for SeaOrmStorage {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<WindowCount> {
        for _ in 0..2 {
            // Bump the live window if one exists.
            let mut query = Query::update();
            query.table(rate_limit_counters::Entity);
            query.value(
                rate_limit_counters::Column::Count,
                Expr::col(rate_limit_counters::Column::Count).add(1),
            );
            query.and_where(rate_limit_counters::Column::Key.eq(key));
            query.and_where(rate_limit_counters::Column::WindowExpiresAt.gt(now));

            let bumped: Option<rate_limit_counters::Model> =
                update_returning_one(self.connection(), query).await?;
            if let Some(model) = bumped {
                return Ok(WindowCount {
                    count: model.count,
                    window_expires_at: model.window_expires_at,
                });
            }

            // No live window: try to open one.
            let expires_at = now + window;
            let model = rate_limit_counters::ActiveModel {
                key: Set(key.to_owned()),
                count: Set(1),
                window_expires_at: Set(expires_at),
            };
            let inserted = rate_limit_counters::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(rate_limit_counters::Column::Key)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(self.connection())
                .await
                .map_err(StorageError::from_source)?;
            if inserted == 1 {
                return Ok(WindowCount {
                    count: 1,
                    window_expires_at: expires_at,
                });
            }

            // A row exists but its window has lapsed: reset it in place.
            let mut query = Query::update();
            query.table(rate_limit_counters::Entity);
            query.value(rate_limit_counters::Column::Count, 1);
            query.value(rate_limit_counters::Column::WindowExpiresAt, expires_at);
            query.and_where(rate_limit_counters::Column::Key.eq(key));
            query.and_where(rate_limit_counters::Column::WindowExpiresAt.lte(now));

            let reset: Option<rate_limit_counters::Model> =
                update_returning_one(self.connection(), query).await?;
            if let Some(model) = reset {
                return Ok(WindowCount {
                    count: model.count,
                    window_expires_at: model.window_expires_at,
                });
            }
        }

        Err(StorageError::Database(format!(
            "counter contention for key {key}"
        )))
    }
}
