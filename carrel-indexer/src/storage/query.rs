//! Read-side filter model for document listings and statistics.
//!
//! [`DocumentFilter`] is a conjunction of optional predicates; the storage
//! layer assembles it into a WHERE clause with bound parameters. Date
//! filtering accepts either an explicit range or a named bucket evaluated
//! against a supplied instant, so bucket math stays a pure function.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use crate::storage::{Document, DocumentCategory, IndexStatus};

/// Named creation-date buckets, all evaluated in UTC. Weeks are ISO weeks
/// starting Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBucket {
    Today,
    ThisWeek,
    ThisMonth,
    ThisYear,
}

impl DateBucket {
    /// The instant the bucket begins, relative to `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start_date = match self {
            DateBucket::Today => date,
            DateBucket::ThisWeek => {
                date - Days::new(u64::from(date.weekday().num_days_from_monday()))
            }
            DateBucket::ThisMonth => date - Days::new(u64::from(date.day0())),
            DateBucket::ThisYear => date - Days::new(u64::from(date.ordinal0())),
        };
        Utc.from_utc_datetime(&start_date.and_time(NaiveTime::MIN))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DateBucket::Today => "today",
            DateBucket::ThisWeek => "this_week",
            DateBucket::ThisMonth => "this_month",
            DateBucket::ThisYear => "this_year",
        }
    }
}

impl fmt::Display for DateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "today" => Ok(DateBucket::Today),
            "this_week" => Ok(DateBucket::ThisWeek),
            "this_month" => Ok(DateBucket::ThisMonth),
            "this_year" => Ok(DateBucket::ThisYear),
            other => Err(format!(
                "unknown date bucket '{other}' (expected today, this_week, this_month, or this_year)"
            )),
        }
    }
}

/// Creation-date predicate: an explicit inclusive range or a named bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatedFilter {
    Range {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
    Bucket(DateBucket),
}

impl CreatedFilter {
    /// Resolve to inclusive bounds relative to `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match self {
            CreatedFilter::Range { from, to } => (*from, *to),
            CreatedFilter::Bucket(bucket) => (Some(bucket.start(now)), None),
        }
    }
}

/// Conjunction of list predicates. Empty vectors and `None` fields mean
/// "no constraint".
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<IndexStatus>,
    pub category: Option<DocumentCategory>,
    pub project_ids: Vec<i64>,
    pub uploader_ids: Vec<i64>,
    pub file_type: Option<String>,
    pub created: Option<CreatedFilter>,
    /// Case-insensitive substring match over file name and description.
    pub search: Option<String>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: IndexStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_category(mut self, category: DocumentCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_project_id(mut self, project_id: i64) -> Self {
        self.project_ids.push(project_id);
        self
    }

    pub fn with_uploader_id(mut self, uploader_id: i64) -> Self {
        self.uploader_ids.push(uploader_id);
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_created(mut self, created: CreatedFilter) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Assemble the WHERE clause (without the `WHERE` keyword) and its bind
    /// values, in placeholder order. Empty when unconstrained.
    pub(crate) fn where_clause(&self, now: DateTime<Utc>) -> (String, Vec<SqlBind>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut binds: Vec<SqlBind> = Vec::new();

        if let Some(status) = self.status {
            conditions.push("index_status = ?".into());
            binds.push(SqlBind::Text(status.as_str().into()));
        }
        if let Some(category) = self.category {
            conditions.push("category = ?".into());
            binds.push(SqlBind::Text(category.as_str().into()));
        }
        if !self.project_ids.is_empty() {
            conditions.push(format!(
                "project_id IN ({})",
                placeholders(self.project_ids.len())
            ));
            binds.extend(self.project_ids.iter().map(|id| SqlBind::Int(*id)));
        }
        if !self.uploader_ids.is_empty() {
            conditions.push(format!(
                "uploaded_by IN ({})",
                placeholders(self.uploader_ids.len())
            ));
            binds.extend(self.uploader_ids.iter().map(|id| SqlBind::Int(*id)));
        }
        if let Some(file_type) = &self.file_type {
            conditions.push("file_type = ?".into());
            binds.push(SqlBind::Text(file_type.to_ascii_lowercase()));
        }
        if let Some(created) = &self.created {
            let (from, to) = created.bounds(now);
            if let Some(from) = from {
                conditions.push("created_at >= ?".into());
                binds.push(SqlBind::Int(from.timestamp()));
            }
            if let Some(to) = to {
                conditions.push("created_at <= ?".into());
                binds.push(SqlBind::Int(to.timestamp()));
            }
        }
        if let Some(search) = &self.search {
            let needle = format!("%{}%", search.trim().to_lowercase());
            conditions.push("(LOWER(file_name) LIKE ? OR LOWER(description) LIKE ?)".into());
            binds.push(SqlBind::Text(needle.clone()));
            binds.push(SqlBind::Text(needle));
        }

        (conditions.join(" AND "), binds)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// A bound parameter for dynamically assembled SQL.
#[derive(Debug, Clone)]
pub(crate) enum SqlBind {
    Int(i64),
    Text(String),
}

/// One page of a filtered listing. `total_count` covers the whole filtered
/// set, independent of the page.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Aggregate document statistics. `total_count` always equals the sum of
/// the per-category counts; every category appears, zero or not.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStats {
    pub total_count: u64,
    pub counts_by_category: HashMap<DocumentCategory, u64>,
}
