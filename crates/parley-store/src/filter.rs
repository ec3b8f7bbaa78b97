//! Conversation list projections.
//!
//! A [`ConversationFilter`] is a pure predicate over a [`Conversation`]; the
//! store applies it lazily while iterating its ordered index.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::models::Conversation;

/// Tab-style category of the conversation list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    All,
    Unread,
    Direct,
    Group,
    Pinned,
    Archived,
    JobRelated,
}

/// Calendar window on the last message timestamp (UTC, weeks start Monday).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DateRange {
    #[default]
    All,
    Today,
    ThisWeek,
    ThisMonth,
}

impl DateRange {
    fn contains(self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let day = ts.date_naive();
        let today = now.date_naive();
        match self {
            DateRange::All => true,
            DateRange::Today => day == today,
            DateRange::ThisWeek => {
                let days_from_monday = i64::from(today.weekday().num_days_from_monday());
                let week_start = today - Duration::days(days_from_monday);
                day >= week_start && day <= today
            }
            DateRange::ThisMonth => day.year() == today.year() && day.month() == today.month(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConversationFilter {
    /// Case-insensitive text matched against name, last message and participants.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub date: DateRange,
}

impl ConversationFilter {
    pub fn category(category: Category) -> Self {
        Self {
            category,
            ..Self::default()
        }
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn with_date(mut self, date: DateRange) -> Self {
        self.date = date;
        self
    }

    pub fn matches(&self, conversation: &Conversation, now: DateTime<Utc>) -> bool {
        self.matches_category(conversation)
            && self.matches_search(conversation)
            && self.matches_date(conversation, now)
    }

    fn matches_category(&self, c: &Conversation) -> bool {
        // Archived conversations only show up under their own tab.
        if c.is_archived {
            return self.category == Category::Archived;
        }
        match self.category {
            Category::All => true,
            Category::Unread => c.unread_count > 0,
            Category::Direct => !c.is_group,
            Category::Group => c.is_group,
            Category::Pinned => c.is_pinned,
            Category::Archived => false,
            Category::JobRelated => c.job_related.is_some(),
        }
    }

    fn matches_search(&self, c: &Conversation) -> bool {
        let needle = match self.search.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_lowercase(),
            _ => return true,
        };
        let name_hit = c
            .name
            .as_deref()
            .is_some_and(|n| n.to_lowercase().contains(&needle));
        let text_hit = c
            .last_message
            .as_ref()
            .is_some_and(|m| m.text.to_lowercase().contains(&needle));
        let participant_hit = c
            .participants
            .iter()
            .any(|p| p.as_str().to_lowercase().contains(&needle));
        name_hit || text_hit || participant_hit
    }

    fn matches_date(&self, c: &Conversation, now: DateTime<Utc>) -> bool {
        match self.date {
            DateRange::All => true,
            range => c
                .last_message
                .as_ref()
                .is_some_and(|m| range.contains(m.timestamp, now)),
        }
    }
}
