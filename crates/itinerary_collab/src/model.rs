//! Plain itinerary data handed to and received from the UI layer.
//!
//! These types know nothing about replication. They serialize with the
//! camelCase field names the UI uses (`dayIndex`, `startTime`, `type`, ...).

use crate::error::{CollabError, CollabResult};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

/// Geographic position of a block
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

/// One scheduled item of a day
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub block_type: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<Coords>,
}

/// A calendar day and its ordered blocks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Day {
    pub date: String,
    pub day_index: i64,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Day {
    pub fn new(date: impl Into<String>, day_index: i64) -> Self {
        Self {
            date: date.into(),
            day_index,
            blocks: Vec::new(),
        }
    }
}

/// A block as submitted by the UI, before an id is assigned
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlock {
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub block_type: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<Coords>,
}

impl NewBlock {
    /// Check the fields every block needs.
    ///
    /// Scheduling rules (start before end, overlaps) are not checked here.
    pub fn validate(&self) -> CollabResult<()> {
        require("date", &self.date)?;
        require("title", &self.title)?;
        require("type", &self.block_type)?;
        require("category", &self.category)?;

        NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| invalid("date", format!("{:?} is not YYYY-MM-DD: {e}", self.date)))?;
        for (field, value) in [("startTime", &self.start_time), ("endTime", &self.end_time)] {
            NaiveTime::parse_from_str(value, TIME_FORMAT)
                .map_err(|e| invalid(field, format!("{value:?} is not HH:MM: {e}")))?;
        }
        if let Some(duration) = self.duration_min {
            if duration < 0 {
                return Err(invalid("durationMin", "must not be negative".to_string()));
            }
        }
        Ok(())
    }

    /// Attach an id, producing a full block.
    pub fn with_id(self, id: impl Into<String>) -> Block {
        Block {
            id: id.into(),
            date: self.date,
            start_time: self.start_time,
            end_time: self.end_time,
            title: self.title,
            description: self.description,
            block_type: self.block_type,
            category: self.category,
            duration_min: self.duration_min,
            coords: self.coords,
        }
    }
}

fn require(field: &'static str, value: &str) -> CollabResult<()> {
    if value.trim().is_empty() {
        Err(invalid(field, "is required".to_string()))
    } else {
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> CollabError {
    CollabError::InvalidBlock { field, reason }
}

/// Fields to overwrite on an existing block; `None` leaves a field alone
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockPatch {
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub block_type: Option<String>,
    pub category: Option<String>,
    pub duration_min: Option<i64>,
    pub coords: Option<Coords>,
}

impl BlockPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Check the fields that are present, with the same rules as [`NewBlock`].
    pub fn validate(&self) -> CollabResult<()> {
        let required = [
            ("title", &self.title),
            ("type", &self.block_type),
            ("category", &self.category),
        ];
        for (field, value) in required {
            if let Some(value) = value {
                require(field, value)?;
            }
        }
        if let Some(date) = &self.date {
            NaiveDate::parse_from_str(date, DATE_FORMAT)
                .map_err(|e| invalid("date", format!("{date:?} is not YYYY-MM-DD: {e}")))?;
        }
        for (field, value) in [("startTime", &self.start_time), ("endTime", &self.end_time)] {
            if let Some(value) = value {
                NaiveTime::parse_from_str(value, TIME_FORMAT)
                    .map_err(|e| invalid(field, format!("{value:?} is not HH:MM: {e}")))?;
            }
        }
        if matches!(self.duration_min, Some(duration) if duration < 0) {
            return Err(invalid("durationMin", "must not be negative".to_string()));
        }
        Ok(())
    }
}

/// A remark attached to a block's thread
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_avatar: Option<String>,
    pub content: String,
    /// RFC 3339
    pub timestamp: String,
}

/// Discussion attached to one block; `id` is the block id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThread {
    pub id: String,
    pub is_resolved: bool,
    pub comments: Vec<Comment>,
}

/// The signed-in user, as supplied by the auth layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}
