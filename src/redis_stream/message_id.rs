// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stream Entry Ids
//!
//! Redis stream ids are `{major}-{minor}` pairs of unsigned 64-bit integers,
//! ordered component-wise. Besides the full form, `"123"` and `"5-"` are read
//! as `123-0` and `5-0`, and `"-"` as the minimum. The minimum renders as `"0"`.

use crate::errors::QueueError;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub major: u64,
    pub minor: u64,
}

impl MessageId {
    pub const MIN: MessageId = MessageId { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u64) -> MessageId {
        MessageId { major, minor }
    }

    /// Smallest id strictly greater than `self`.
    pub fn next(self) -> Option<MessageId> {
        match self.minor.checked_add(1) {
            Some(minor) => Some(MessageId::new(self.major, minor)),
            None => self.major.checked_add(1).map(|major| MessageId::new(major, 0)),
        }
    }

    /// Largest id strictly smaller than `self`, clamped at the minimum.
    pub fn prev(self) -> MessageId {
        match (self.major, self.minor) {
            (0, 0) => MessageId::MIN,
            (major, 0) => MessageId::new(major - 1, u64::MAX),
            (major, minor) => MessageId::new(major, minor - 1),
        }
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::InvalidMessageId(text.to_owned());

        let (major, minor) = match text.split_once('-') {
            Some((major, minor)) => (major, minor),
            None => (text, ""),
        };

        if major.is_empty() && minor.is_empty() {
            return if text == "-" { Ok(MessageId::MIN) } else { Err(invalid()) };
        }

        let parse = |part: &str| -> Result<u64, QueueError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        };

        let major = parse(major)?;
        let minor = if minor.is_empty() { 0 } else { parse(minor)? };

        Ok(MessageId::new(major, minor))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == MessageId::MIN {
            return write!(f, "0");
        }
        write!(f, "{}-{}", self.major, self.minor)
    }
}

/// Smallest id strictly greater than `id`.
pub fn increment(id: &str) -> Result<String, QueueError> {
    let parsed: MessageId = id.parse()?;
    parsed
        .next()
        .map(|next| next.to_string())
        .ok_or_else(|| QueueError::InvalidMessageId(id.to_owned()))
}

/// Largest id strictly smaller than `id`, never below `"0"`.
pub fn decrement(id: &str) -> Result<String, QueueError> {
    let parsed: MessageId = id.parse()?;
    Ok(parsed.prev().to_string())
}
