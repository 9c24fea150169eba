// src/store/postgres.rs
//
// sqlx-backed implementation of the persistence interfaces. Every
// multi-write operation runs in one transaction; slot and section
// renumbering uses a two-phase sign flip so the UNIQUE constraints never
// trip on intermediate states.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::AppError;
use crate::models::attempt::{Attempt, AttemptFilter, QuestionFraction, STATE_FINISHED};
use crate::models::regrade::RegradeRecord;
use crate::models::slot::{QuestionMeta, Section, Slot};
use crate::models::statistics::{AttemptSelection, CalculatedStatistics};
use crate::store::{AttemptStore, NewSection, QuizStore, StatsStore, StructureUpdate};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Per-user sum-of-grades selection for one policy, with an optional
    /// student filter.
    fn grades_query(
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(match policy {
            AttemptSelection::First | AttemptSelection::Last | AttemptSelection::Highest => {
                "SELECT DISTINCT ON (user_id) COALESCE(sum_grades, 0) FROM quiz_attempts WHERE quiz_id = "
            }
            AttemptSelection::Average => {
                "SELECT AVG(COALESCE(sum_grades, 0)) FROM quiz_attempts WHERE quiz_id = "
            }
        });
        builder.push_bind(quiz_id);
        builder.push(" AND state = ");
        builder.push_bind(STATE_FINISHED);
        if let Some(list) = students {
            builder.push(" AND user_id = ANY(");
            builder.push_bind(list.to_vec());
            builder.push(")");
        }
        builder.push(match policy {
            AttemptSelection::First => " ORDER BY user_id, attempt_number ASC",
            AttemptSelection::Last => " ORDER BY user_id, attempt_number DESC",
            AttemptSelection::Highest => " ORDER BY user_id, COALESCE(sum_grades, 0) DESC",
            AttemptSelection::Average => " GROUP BY user_id ORDER BY user_id",
        });
        builder
    }

    /// Usage ids of the attempts contributing under a policy. `Average`
    /// includes every finished attempt.
    fn usages_query(
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(match policy {
            AttemptSelection::Average => "SELECT usage_id FROM quiz_attempts WHERE quiz_id = ",
            _ => "SELECT DISTINCT ON (user_id) usage_id FROM quiz_attempts WHERE quiz_id = ",
        });
        builder.push_bind(quiz_id);
        builder.push(" AND state = ");
        builder.push_bind(STATE_FINISHED);
        if let Some(list) = students {
            builder.push(" AND user_id = ANY(");
            builder.push_bind(list.to_vec());
            builder.push(")");
        }
        builder.push(match policy {
            AttemptSelection::First => " ORDER BY user_id, attempt_number ASC",
            AttemptSelection::Last => " ORDER BY user_id, attempt_number DESC",
            AttemptSelection::Highest => " ORDER BY user_id, COALESCE(sum_grades, 0) DESC",
            AttemptSelection::Average => "",
        });
        builder
    }
}

#[async_trait]
impl QuizStore for PgStore {
    async fn load_slots(&self, quiz_id: i64) -> Result<Vec<Slot>, AppError> {
        let slots = sqlx::query_as::<_, Slot>(
            r#"
            SELECT id, quiz_id, slot, question_id, page, max_mark, require_previous
            FROM quiz_slots
            WHERE quiz_id = $1
            ORDER BY slot
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(slots)
    }

    async fn load_sections(&self, quiz_id: i64) -> Result<Vec<Section>, AppError> {
        let sections = sqlx::query_as::<_, Section>(
            r#"
            SELECT id, quiz_id, first_slot, heading, shuffle_questions
            FROM quiz_sections
            WHERE quiz_id = $1
            ORDER BY first_slot
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sections)
    }

    async fn load_question_meta(
        &self,
        question_ids: &[i64],
    ) -> Result<Vec<QuestionMeta>, AppError> {
        let metas = sqlx::query_as::<_, QuestionMeta>(
            r#"
            SELECT id AS question_id, type, length, is_random
            FROM questions
            WHERE id = ANY($1)
            "#,
        )
        .bind(question_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(metas)
    }

    async fn has_attempts(&self, quiz_id: i64) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM quiz_attempts WHERE quiz_id = $1)",
        )
        .bind(quiz_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn apply_structure_update(
        &self,
        quiz_id: i64,
        update: StructureUpdate,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        if !update.delete_slots.is_empty() {
            sqlx::query("DELETE FROM quiz_slots WHERE quiz_id = $1 AND id = ANY($2)")
                .bind(quiz_id)
                .bind(update.delete_slots.clone())
                .execute(&mut *tx)
                .await?;
        }
        if !update.delete_sections.is_empty() {
            sqlx::query("DELETE FROM quiz_sections WHERE quiz_id = $1 AND id = ANY($2)")
                .bind(quiz_id)
                .bind(update.delete_sections.clone())
                .execute(&mut *tx)
                .await?;
        }

        // Phase one writes negated values so UNIQUE (quiz_id, slot) never
        // sees a duplicate mid-renumber; phase two flips the sign back.
        for entry in &update.renumber {
            sqlx::query("UPDATE quiz_slots SET slot = $1 WHERE id = $2 AND quiz_id = $3")
                .bind(-entry.new_number)
                .bind(entry.slot_id)
                .bind(quiz_id)
                .execute(&mut *tx)
                .await?;
        }
        if !update.renumber.is_empty() {
            sqlx::query("UPDATE quiz_slots SET slot = -slot WHERE quiz_id = $1 AND slot < 0")
                .bind(quiz_id)
                .execute(&mut *tx)
                .await?;
        }

        for entry in &update.pages {
            sqlx::query("UPDATE quiz_slots SET page = $1 WHERE id = $2 AND quiz_id = $3")
                .bind(entry.new_page)
                .bind(entry.slot_id)
                .bind(quiz_id)
                .execute(&mut *tx)
                .await?;
        }

        for entry in &update.section_moves {
            sqlx::query(
                "UPDATE quiz_sections SET first_slot = $1 WHERE id = $2 AND quiz_id = $3",
            )
            .bind(-entry.new_first_slot)
            .bind(entry.section_id)
            .bind(quiz_id)
            .execute(&mut *tx)
            .await?;
        }
        if !update.section_moves.is_empty() {
            sqlx::query(
                "UPDATE quiz_sections SET first_slot = -first_slot WHERE quiz_id = $1 AND first_slot < 0",
            )
            .bind(quiz_id)
            .execute(&mut *tx)
            .await?;
        }

        if !update.delete_questions.is_empty() {
            sqlx::query("DELETE FROM questions WHERE id = ANY($1)")
                .bind(update.delete_questions.clone())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_section(&self, section: NewSection) -> Result<i64, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO quiz_sections (quiz_id, first_slot, heading, shuffle_questions)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(section.quiz_id)
        .bind(section.first_slot)
        .bind(section.heading)
        .bind(section.shuffle_questions)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_section_heading(
        &self,
        section_id: i64,
        heading: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE quiz_sections SET heading = $1 WHERE id = $2")
            .bind(heading)
            .bind(section_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Section not found".to_string()));
        }
        Ok(())
    }

    async fn update_section_shuffle(
        &self,
        section_id: i64,
        shuffle: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE quiz_sections SET shuffle_questions = $1 WHERE id = $2")
            .bind(shuffle)
            .bind(section_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Section not found".to_string()));
        }
        Ok(())
    }

    async fn update_slot_max_mark(&self, slot_id: i64, max_mark: f64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE quiz_slots SET max_mark = $1 WHERE id = $2")
            .bind(max_mark)
            .bind(slot_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Slot not found".to_string()));
        }
        Ok(())
    }

    async fn update_slot_require_previous(
        &self,
        slot_id: i64,
        require_previous: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE quiz_slots SET require_previous = $1 WHERE id = $2")
            .bind(require_previous)
            .bind(slot_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Slot not found".to_string()));
        }
        Ok(())
    }

    async fn is_orphan_random_question(
        &self,
        question_id: i64,
        excluding_slot: i64,
    ) -> Result<bool, AppError> {
        let orphan = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT q.is_random AND NOT EXISTS (
                SELECT 1 FROM quiz_slots s WHERE s.question_id = q.id AND s.id <> $2
            )
            FROM questions q
            WHERE q.id = $1
            "#,
        )
        .bind(question_id)
        .bind(excluding_slot)
        .fetch_optional(&self.pool)
        .await?;
        Ok(orphan.unwrap_or(false))
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn grade_count_and_mean(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<(i64, Option<f64>), AppError> {
        let grades = self.sum_of_grades(quiz_id, policy, students).await?;
        if grades.is_empty() {
            return Ok((0, None));
        }
        let mean = grades.iter().sum::<f64>() / grades.len() as f64;
        Ok((grades.len() as i64, Some(mean)))
    }

    async fn sum_of_grades(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Vec<f64>, AppError> {
        let mut builder = Self::grades_query(quiz_id, policy, students);
        let grades = builder
            .build_query_scalar::<f64>()
            .fetch_all(&self.pool)
            .await?;
        Ok(grades)
    }

    async fn mark_variance_sum(
        &self,
        quiz_id: i64,
        policy: AttemptSelection,
        students: Option<&[i64]>,
    ) -> Result<Option<f64>, AppError> {
        let mut builder = Self::usages_query(quiz_id, policy, students);
        let usages = builder
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await?;
        if usages.is_empty() {
            return Ok(None);
        }

        let variances = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT VAR_SAMP(COALESCE(fraction, 0) * max_mark)
            FROM attempt_usages
            WHERE usage_id = ANY($1)
            GROUP BY slot
            "#,
        )
        .bind(usages)
        .fetch_all(&self.pool)
        .await?;

        let mut total = None;
        for variance in variances.into_iter().flatten() {
            *total.get_or_insert(0.0) += variance;
        }
        Ok(total)
    }

    async fn attempts(
        &self,
        quiz_id: i64,
        filter: &AttemptFilter,
    ) -> Result<Vec<Attempt>, AppError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, quiz_id, user_id, usage_id, attempt_number, state, sum_grades, time_finish \
             FROM quiz_attempts WHERE quiz_id = ",
        );
        builder.push_bind(quiz_id);
        builder.push(" AND state = ");
        builder.push_bind(STATE_FINISHED);
        if let Some(students) = &filter.students {
            builder.push(" AND user_id = ANY(");
            builder.push_bind(students.clone());
            builder.push(")");
        }
        if let Some(ids) = &filter.attempt_ids {
            builder.push(" AND id = ANY(");
            builder.push_bind(ids.clone());
            builder.push(")");
        }
        builder.push(" ORDER BY id");

        let attempts = builder
            .build_query_as::<Attempt>()
            .fetch_all(&self.pool)
            .await?;
        Ok(attempts)
    }

    async fn question_fractions(
        &self,
        usage_id: i64,
    ) -> Result<Vec<QuestionFraction>, AppError> {
        let fractions = sqlx::query_as::<_, QuestionFraction>(
            r#"
            SELECT usage_id, slot, fraction, max_mark
            FROM attempt_usages
            WHERE usage_id = $1
            ORDER BY slot
            "#,
        )
        .bind(usage_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(fractions)
    }

    async fn apply_regrade(
        &self,
        attempt: &Attempt,
        records: &[RegradeRecord],
        new_sum_grades: Option<f64>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO quiz_regrades
                    (usage_id, slot, old_fraction, new_fraction, regraded, time_modified)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (usage_id, slot) DO UPDATE SET
                    old_fraction = EXCLUDED.old_fraction,
                    new_fraction = EXCLUDED.new_fraction,
                    regraded = EXCLUDED.regraded,
                    time_modified = EXCLUDED.time_modified
                "#,
            )
            .bind(record.usage_id)
            .bind(record.slot)
            .bind(record.old_fraction)
            .bind(record.new_fraction)
            .bind(record.regraded)
            .bind(record.time_modified)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(sum) = new_sum_grades {
            for record in records {
                sqlx::query(
                    "UPDATE attempt_usages SET fraction = $1 WHERE usage_id = $2 AND slot = $3",
                )
                .bind(record.new_fraction)
                .bind(record.usage_id)
                .bind(record.slot)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE quiz_attempts SET sum_grades = $1 WHERE id = $2")
                .bind(sum)
                .bind(attempt.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear_regrade_records(
        &self,
        quiz_id: i64,
        attempt_ids: Option<&[i64]>,
    ) -> Result<(), AppError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "DELETE FROM quiz_regrades WHERE usage_id IN \
             (SELECT usage_id FROM quiz_attempts WHERE quiz_id = ",
        );
        builder.push_bind(quiz_id);
        if let Some(ids) = attempt_ids {
            builder.push(" AND id = ANY(");
            builder.push_bind(ids.to_vec());
            builder.push(")");
        }
        builder.push(")");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn records_needing_regrade(
        &self,
        quiz_id: i64,
    ) -> Result<Vec<RegradeRecord>, AppError> {
        let records = sqlx::query_as::<_, RegradeRecord>(
            r#"
            SELECT r.usage_id, r.slot, r.old_fraction, r.new_fraction, r.regraded, r.time_modified
            FROM quiz_regrades r
            JOIN quiz_attempts a ON a.usage_id = r.usage_id
            WHERE a.quiz_id = $1 AND NOT r.regraded
            ORDER BY r.usage_id, r.slot
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn count_needing_regrade(&self, quiz_id: i64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM quiz_regrades r
            JOIN quiz_attempts a ON a.usage_id = r.usage_id
            WHERE a.quiz_id = $1 AND NOT r.regraded
            "#,
        )
        .bind(quiz_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn recompute_quiz_grades(&self, quiz_id: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE quiz_attempts a
            SET sum_grades = totals.total
            FROM (
                SELECT usage_id, SUM(COALESCE(fraction, 0) * max_mark) AS total
                FROM attempt_usages
                GROUP BY usage_id
            ) totals
            WHERE totals.usage_id = a.usage_id AND a.quiz_id = $1 AND a.state = $2
            "#,
        )
        .bind(quiz_id)
        .bind(STATE_FINISHED)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_usage_max_mark(
        &self,
        quiz_id: i64,
        slot_number: i64,
        max_mark: f64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE attempt_usages SET max_mark = $1
            WHERE slot = $2
              AND usage_id IN (SELECT usage_id FROM quiz_attempts WHERE quiz_id = $3)
            "#,
        )
        .bind(max_mark)
        .bind(slot_number)
        .bind(quiz_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for PgStore {
    async fn get_statistics(
        &self,
        hash: &str,
    ) -> Result<Option<CalculatedStatistics>, AppError> {
        let row = sqlx::query_scalar::<_, sqlx::types::Json<CalculatedStatistics>>(
            "SELECT data FROM quiz_statistics WHERE hash_code = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|json| json.0))
    }

    async fn put_statistics(
        &self,
        hash: &str,
        stats: &CalculatedStatistics,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO quiz_statistics (hash_code, quiz_id, data, time_modified)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash_code) DO UPDATE SET
                quiz_id = EXCLUDED.quiz_id,
                data = EXCLUDED.data,
                time_modified = EXCLUDED.time_modified
            "#,
        )
        .bind(hash)
        .bind(stats.quiz_id)
        .bind(sqlx::types::Json(stats))
        .bind(stats.time_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_calculated_time(
        &self,
        hash: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, AppError> {
        let time = sqlx::query_scalar::<_, chrono::DateTime<chrono::Utc>>(
            "SELECT time_modified FROM quiz_statistics WHERE hash_code = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(time)
    }

    async fn invalidate(&self, hash: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM question_statistics WHERE hash_code = $1")
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM quiz_statistics WHERE hash_code = $1")
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn invalidate_quiz(&self, quiz_id: i64) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM question_statistics
            WHERE hash_code IN (SELECT hash_code FROM quiz_statistics WHERE quiz_id = $1)
            "#,
        )
        .bind(quiz_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM quiz_statistics WHERE quiz_id = $1")
            .bind(quiz_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
