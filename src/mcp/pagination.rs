//! Cursor-based pagination over list endpoints.
//!
//! A [`Paginator`] walks `resources/list`, `resources/templates/list`,
//! `tools/list` or `prompts/list` page by page. The cursor is opaque and
//! server-assigned; a page without a `nextCursor` (or with an empty one) ends
//! the walk. A failed request also ends it; there is no automatic resume.
//! A server that hands out a cursor it already returned during the walk is
//! treated as a protocol error rather than followed around the loop.

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{McpError, ProtocolError};
use crate::mcp::connection::{Connection, ConnectionRegistry};
use crate::mcp::protocol::methods;

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Items in server order.
    pub items: Vec<Value>,
    /// Cursor for the following page; `None` on the last page.
    pub next_cursor: Option<String>,
    /// `true` when another page follows.
    pub has_more: bool,
    /// Items seen so far, including this page.
    pub total_seen: usize,
}

/// Returns the result field holding the items of a list method.
#[must_use]
pub fn items_field(method: &str) -> Option<&'static str> {
    match method {
        methods::RESOURCES_LIST => Some("resources"),
        methods::RESOURCES_TEMPLATES_LIST => Some("resourceTemplates"),
        methods::TOOLS_LIST => Some("tools"),
        methods::PROMPTS_LIST => Some("prompts"),
        _ => None,
    }
}

/// Iterator over the pages of one list endpoint.
#[derive(Debug)]
pub struct Paginator {
    connection: Arc<Connection>,
    method: String,
    items_field: &'static str,
    limit: Option<u32>,
    cursor: Option<String>,
    finished: bool,
    pages_fetched: usize,
    total_fetched: usize,
    last_error: Option<String>,
    seen_cursors: HashSet<String>,
}

impl Paginator {
    /// Creates a paginator positioned before the first page.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidParams`] when `method` is not a list method.
    pub fn new(connection: Arc<Connection>, method: &str) -> Result<Self, McpError> {
        let items_field = items_field(method)
            .ok_or_else(|| McpError::InvalidParams(format!("{method} is not a paginated method")))?;
        Ok(Self {
            connection,
            method: method.to_string(),
            items_field,
            limit: None,
            cursor: None,
            finished: false,
            pages_fetched: 0,
            total_fetched: 0,
            last_error: None,
            seen_cursors: HashSet::new(),
        })
    }

    /// Creates a paginator for a connection looked up by server name.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidParams`] when no connection is registered
    /// under `server_name` or `method` is not a list method.
    pub fn for_server(
        registry: &ConnectionRegistry,
        server_name: &str,
        method: &str,
    ) -> Result<Self, McpError> {
        let connection = registry.get(server_name).ok_or_else(|| {
            McpError::InvalidParams(format!("no connection registered as {server_name}"))
        })?;
        Self::new(connection, method)
    }

    /// Sends `limit` as a page-size hint with every request.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Method being paginated.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `true` before the first page and while the last page had a cursor.
    #[must_use]
    pub const fn has_next(&self) -> bool {
        !self.finished
    }

    /// Cursor the next request will carry.
    #[must_use]
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Items fetched since the last reset.
    #[must_use]
    pub const fn total_fetched(&self) -> usize {
        self.total_fetched
    }

    /// Pages fetched since the last reset.
    #[must_use]
    pub const fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Error that ended the walk, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns to the first page. The connection is untouched.
    pub fn reset(&mut self) {
        self.cursor = None;
        self.finished = false;
        self.pages_fetched = 0;
        self.total_fetched = 0;
        self.last_error = None;
        self.seen_cursors.clear();
    }

    /// Fetches the next page, or `None` once the walk has ended.
    ///
    /// # Errors
    ///
    /// Returns the request's error; the walk is then finished.
    pub async fn next_page(&mut self) -> Result<Option<Page>, McpError> {
        if self.finished {
            return Ok(None);
        }

        let result = self
            .connection
            .list_page(&self.method, self.cursor.as_deref(), self.limit)
            .await
            .and_then(|result| self.parse_page(result))
            .and_then(|(items, next_cursor)| match next_cursor {
                Some(cursor) if self.seen_cursors.contains(&cursor) => {
                    Err(ProtocolError::malformed(format!(
                        "{} repeated cursor '{cursor}'",
                        self.method
                    ))
                    .into())
                }
                next_cursor => Ok((items, next_cursor)),
            });

        match result {
            Ok((items, next_cursor)) => {
                if let Some(cursor) = &next_cursor {
                    self.seen_cursors.insert(cursor.clone());
                }
                self.pages_fetched += 1;
                self.total_fetched += items.len();
                debug!(
                    method = %self.method,
                    page = self.pages_fetched,
                    items = items.len(),
                    next_cursor = next_cursor.as_deref().unwrap_or(""),
                    "Fetched page"
                );
                self.finished = next_cursor.is_none();
                self.cursor.clone_from(&next_cursor);
                Ok(Some(Page {
                    items,
                    has_more: next_cursor.is_some(),
                    next_cursor,
                    total_seen: self.total_fetched,
                }))
            }
            Err(e) => {
                warn!(method = %self.method, error = %e, "Pagination stopped");
                self.finished = true;
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn parse_page(&self, mut result: Value) -> Result<(Vec<Value>, Option<String>), McpError> {
        let items = match result.get_mut(self.items_field).map(Value::take) {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(ProtocolError::malformed(format!(
                    "{} result field {} is not a list",
                    self.method, self.items_field
                ))
                .into())
            }
        };
        let next_cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        Ok((items, next_cursor))
    }

    /// Restarts from the first page and collects every item in order.
    ///
    /// # Errors
    ///
    /// Returns the first failing request's error.
    pub async fn fetch_all(&mut self) -> Result<Vec<Value>, McpError> {
        self.reset();
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.items);
        }
        Ok(all)
    }

    /// Like [`Self::fetch_all`], deserialising each item.
    ///
    /// # Errors
    ///
    /// Returns the first failing request's error, or a protocol error for an
    /// item of the wrong shape.
    pub async fn fetch_all_as<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, McpError> {
        self.fetch_all()
            .await?
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| {
                    McpError::from(ProtocolError::malformed(format!(
                        "unexpected {} item: {e}",
                        self.method
                    )))
                })
            })
            .collect()
    }
}
