// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! MQTT topic names and topic filters.

use crate::errors::QueueError;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";
const MAX_TOPIC_LEN: usize = 65_535;

fn check_common(value: &str) -> Result<(), QueueError> {
    if value.is_empty() {
        return Err(QueueError::InvalidArgument("topic must not be empty".to_owned()));
    }
    if value.len() > MAX_TOPIC_LEN || value.contains('\0') {
        return Err(QueueError::InvalidArgument(format!("invalid topic `{}`", value)));
    }
    Ok(())
}

/// Checks a subscription filter: `+` must fill a whole level and `#` must
/// fill the last one.
pub fn validate_filter(filter: &str) -> Result<(), QueueError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains(MULTI_LEVEL) && (*level != MULTI_LEVEL || i + 1 != levels.len()) {
            return Err(QueueError::InvalidArgument(format!(
                "`#` must be the last level of `{}`",
                filter
            )));
        }
        if level.contains(SINGLE_LEVEL) && *level != SINGLE_LEVEL {
            return Err(QueueError::InvalidArgument(format!(
                "`+` must fill a whole level of `{}`",
                filter
            )));
        }
    }

    Ok(())
}

/// Checks a topic a message is published to; wildcards are not allowed.
pub fn validate_topic_name(topic: &str) -> Result<(), QueueError> {
    check_common(topic)?;

    if topic.contains(['+', '#']) {
        return Err(QueueError::InvalidArgument(format!(
            "wildcards are not allowed in topic `{}`",
            topic
        )));
    }
    Ok(())
}

/// Whether `topic` matches `filter`.
///
/// `sport/#` also matches `sport`. Topics starting with `$` are never
/// matched by a filter starting with a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with(SINGLE_LEVEL) || filter.starts_with(MULTI_LEVEL)) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
