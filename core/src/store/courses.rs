use super::{json_col, text_col, time_col, ActivityRow, AuthorRow, ChapterRow, CourseRow, Store};
use crate::{
    error::NexoResult,
    types::{to_millis, AuthorStatus, Authorship, OrgId, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

const COURSE_COLUMNS: &str =
    "id, course_uuid, org_id, name, description, public, published, created_at, updated_at";
const CHAPTER_COLUMNS: &str = "id, chapter_uuid, course_id, name, description, position";
const ACTIVITY_COLUMNS: &str =
    "id, activity_uuid, chapter_id, name, activity_type, content, position";

fn map_course(row: &Row<'_>) -> rusqlite::Result<CourseRow> {
    Ok(CourseRow {
        id: row.get(0)?,
        course_uuid: row.get(1)?,
        org_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        public: row.get::<_, i32>(5)? != 0,
        published: row.get::<_, i32>(6)? != 0,
        created_at: time_col(row, 7)?,
        updated_at: time_col(row, 8)?,
    })
}

fn map_chapter(row: &Row<'_>) -> rusqlite::Result<ChapterRow> {
    Ok(ChapterRow {
        id: row.get(0)?,
        chapter_uuid: row.get(1)?,
        course_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        position: row.get(5)?,
    })
}

fn map_activity(row: &Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok(ActivityRow {
        id: row.get(0)?,
        activity_uuid: row.get(1)?,
        chapter_id: row.get(2)?,
        name: row.get(3)?,
        activity_type: row.get(4)?,
        content: json_col(row, 5)?,
        position: row.get(6)?,
    })
}

impl Store {
    // ── Course ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_course(
        &self,
        course_uuid: &str,
        org_id: OrgId,
        name: &str,
        description: &str,
        public: bool,
        published: bool,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO course (course_uuid, org_id, name, description, public, published, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![course_uuid, org_id, name, description, public, published, to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn course(&self, course_id: RowId) -> NexoResult<Option<CourseRow>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM course WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![course_id], map_course).optional()?)
    }

    pub fn course_by_uuid(&self, course_uuid: &str) -> NexoResult<Option<CourseRow>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM course WHERE course_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![course_uuid], map_course).optional()?)
    }

    pub fn courses_for_org(&self, org_id: OrgId) -> NexoResult<Vec<CourseRow>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM course WHERE org_id = ?1 ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id], map_course)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Courses the user made or contributes to, newest first.
    pub fn courses_authored_by(&self, user_id: UserId) -> NexoResult<Vec<CourseRow>> {
        let sql = format!(
            "SELECT {COURSE_COLUMNS} FROM course
             WHERE course_uuid IN (
                SELECT resource_uuid FROM resource_author WHERE user_id = ?1 AND status = ?2
             )
             ORDER BY id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, AuthorStatus::Active.as_str()], map_course)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_course(&self, course: &CourseRow, now: DateTime<Utc>) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE course SET name = ?1, description = ?2, public = ?3, published = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                course.name,
                course.description,
                course.public,
                course.published,
                to_millis(now),
                course.id,
            ],
        )?;
        Ok(())
    }

    /// Chapters and activities go with it (ON DELETE CASCADE); authorship
    /// rows are keyed by uuid and removed explicitly.
    pub fn delete_course(&self, course: &CourseRow) -> NexoResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM resource_author WHERE resource_uuid = ?1",
            params![course.course_uuid],
        )?;
        tx.execute("DELETE FROM course WHERE id = ?1", params![course.id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Chapter ────────────────────────────────────────────────

    pub fn insert_chapter(
        &self,
        chapter_uuid: &str,
        course_id: RowId,
        name: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO chapter (chapter_uuid, course_id, name, description, position, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4,
                     (SELECT COALESCE(MAX(position), 0) + 1 FROM chapter WHERE course_id = ?2),
                     ?5, ?5)",
            params![chapter_uuid, course_id, name, description, to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn chapter_by_uuid(&self, chapter_uuid: &str) -> NexoResult<Option<ChapterRow>> {
        let sql = format!("SELECT {CHAPTER_COLUMNS} FROM chapter WHERE chapter_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![chapter_uuid], map_chapter).optional()?)
    }

    pub fn chapter(&self, chapter_id: RowId) -> NexoResult<Option<ChapterRow>> {
        let sql = format!("SELECT {CHAPTER_COLUMNS} FROM chapter WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![chapter_id], map_chapter).optional()?)
    }

    pub fn chapters_for_course(&self, course_id: RowId) -> NexoResult<Vec<ChapterRow>> {
        let sql = format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapter WHERE course_id = ?1 ORDER BY position ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![course_id], map_chapter)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_chapter(
        &self,
        chapter_id: RowId,
        name: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE chapter SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
            params![name, description, to_millis(now), chapter_id],
        )?;
        Ok(())
    }

    /// Rewrite chapter positions to follow `ordered_ids` (1-based).
    pub fn reorder_chapters(&self, course_id: RowId, ordered_ids: &[RowId]) -> NexoResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (index, chapter_id) in ordered_ids.iter().enumerate() {
            tx.execute(
                "UPDATE chapter SET position = ?1 WHERE id = ?2 AND course_id = ?3",
                params![index as i64 + 1, chapter_id, course_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_chapter(&self, chapter_id: RowId) -> NexoResult<()> {
        self.conn.execute("DELETE FROM chapter WHERE id = ?1", params![chapter_id])?;
        Ok(())
    }

    // ── Activity ───────────────────────────────────────────────

    pub fn insert_activity(
        &self,
        activity_uuid: &str,
        chapter_id: RowId,
        name: &str,
        activity_type: &str,
        content: &Value,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO activity (activity_uuid, chapter_id, name, activity_type, content, position, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     (SELECT COALESCE(MAX(position), 0) + 1 FROM activity WHERE chapter_id = ?2),
                     ?6, ?6)",
            params![activity_uuid, chapter_id, name, activity_type, content.to_string(), to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn activity_by_uuid(&self, activity_uuid: &str) -> NexoResult<Option<ActivityRow>> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activity WHERE activity_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![activity_uuid], map_activity).optional()?)
    }

    pub fn activities_for_chapter(&self, chapter_id: RowId) -> NexoResult<Vec<ActivityRow>> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity WHERE chapter_id = ?1 ORDER BY position ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![chapter_id], map_activity)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_activity(
        &self,
        activity_id: RowId,
        name: &str,
        content: &Value,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE activity SET name = ?1, content = ?2, updated_at = ?3 WHERE id = ?4",
            params![name, content.to_string(), to_millis(now), activity_id],
        )?;
        Ok(())
    }

    pub fn delete_activity(&self, activity_id: RowId) -> NexoResult<()> {
        self.conn.execute("DELETE FROM activity WHERE id = ?1", params![activity_id])?;
        Ok(())
    }

    // ── Authorship ─────────────────────────────────────────────

    pub fn upsert_author(
        &self,
        resource_uuid: &str,
        user_id: UserId,
        authorship: Authorship,
        status: AuthorStatus,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "INSERT INTO resource_author (resource_uuid, user_id, authorship, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(resource_uuid, user_id) DO UPDATE SET
                authorship = excluded.authorship,
                status = excluded.status",
            params![resource_uuid, user_id, authorship.as_str(), status.as_str(), to_millis(now)],
        )?;
        Ok(())
    }

    pub fn author(&self, resource_uuid: &str, user_id: UserId) -> NexoResult<Option<AuthorRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT resource_uuid, user_id, authorship, status FROM resource_author
                 WHERE resource_uuid = ?1 AND user_id = ?2",
                params![resource_uuid, user_id],
                |r| {
                    Ok(AuthorRow {
                        resource_uuid: r.get(0)?,
                        user_id: r.get(1)?,
                        authorship: text_col(r, 2)?,
                        status: text_col(r, 3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn authors_of(&self, resource_uuid: &str) -> NexoResult<Vec<AuthorRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_uuid, user_id, authorship, status FROM resource_author
             WHERE resource_uuid = ?1 ORDER BY created_at ASC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![resource_uuid], |r| {
            Ok(AuthorRow {
                resource_uuid: r.get(0)?,
                user_id: r.get(1)?,
                authorship: text_col(r, 2)?,
                status: text_col(r, 3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
