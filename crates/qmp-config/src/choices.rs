//! Closed sets of named options accepted from configuration.
//!
//! Every choice reads the same way from a file, an environment variable or
//! a flag: lower snake case, matched without regard to ASCII case.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

/// How `qmpctl` writes its own diagnostics to stderr.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    EnumString,
    Display,
    VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per diagnostic, fields flattened.
    #[default]
    Json,
    /// Terse text lines for interactive use.
    Compact,
}

/// What a subscriber queue does with a new event when it is already full.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    EnumString,
    Display,
    VariantNames,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventOverflow {
    /// Evict the oldest queued event to make room for the new one.
    #[default]
    DropOldest,
    /// Keep the queue as it is and discard the new event.
    DropNewest,
}

/// Raised when text names none of a choice's variants.
pub type ChoiceParseError = strum::ParseError;
