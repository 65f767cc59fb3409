// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lock identifiers: `ddb://<table>/<item_id>`.

use core::fmt;
use std::str::FromStr;

use crate::lock::{Error, ErrorKind};

/// The only URL scheme currently recognized.
pub const URL_SCHEME: &str = "ddb";

/// Coordinates of one lock record: the DynamoDB table holding it and the
/// item id naming the guarded resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockIdentifier {
    table: String,
    item_id: String,
}

impl LockIdentifier {
    /// Build an identifier from its parts.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`InvalidIdentifier`](ErrorKind::InvalidIdentifier)
    /// if either part is empty.
    pub fn new(table: impl Into<String>, item_id: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        let item_id = item_id.into();
        if table.is_empty() {
            return Err(ErrorKind::InvalidIdentifier("table name is empty".into()).into());
        }
        if item_id.is_empty() {
            return Err(ErrorKind::InvalidIdentifier("item id is empty".into()).into());
        }
        Ok(Self { table, item_id })
    }

    /// The table holding the lock record.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The item id naming the guarded resource.
    #[must_use]
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

impl FromStr for LockIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("ddb://") else {
            return Err(ErrorKind::InvalidIdentifier(format!(
                "`{s}` does not use the {URL_SCHEME}:// scheme"
            ))
            .into());
        };
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [table, item_id] if !table.is_empty() && !item_id.is_empty() => {
                Self::new(*table, *item_id)
            }
            _ => Err(ErrorKind::InvalidIdentifier(format!(
                "`{s}` must name a table and an item, like {URL_SCHEME}://my-table/my-item"
            ))
            .into()),
        }
    }
}

impl fmt::Display for LockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URL_SCHEME}://{}/{}", self.table, self.item_id)
    }
}
