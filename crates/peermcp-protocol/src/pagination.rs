//! Cursor-based pagination over registry listings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use peermcp_core::{McpError, McpResult};
use serde::{Deserialize, Serialize};

use crate::types::{Prompt, Resource, ResourceTemplate, Tool};

/// An opaque pagination cursor: the Base64 encoding of the last returned
/// element's sort key, used as an exclusive lower bound for the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    /// Encodes a sort key into a cursor.
    #[must_use]
    pub fn encode(key: &str) -> Self {
        Cursor(STANDARD.encode(key.as_bytes()))
    }

    /// Decodes the cursor back into the sort key it wraps.
    pub fn decode(&self) -> McpResult<String> {
        let bytes = STANDARD
            .decode(&self.0)
            .map_err(|e| McpError::internal(format!("invalid cursor: {e}")))?;
        String::from_utf8(bytes).map_err(|e| McpError::internal(format!("invalid cursor: {e}")))
    }

    /// Returns true for the empty cursor (start of listing).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Elements that expose a stable sort key for pagination.
pub trait SortKey {
    /// The key this element sorts and pages by.
    fn sort_key(&self) -> &str;
}

impl SortKey for Tool {
    fn sort_key(&self) -> &str {
        &self.name
    }
}

impl SortKey for Prompt {
    fn sort_key(&self) -> &str {
        &self.name
    }
}

impl SortKey for Resource {
    fn sort_key(&self) -> &str {
        &self.uri
    }
}

impl SortKey for ResourceTemplate {
    fn sort_key(&self) -> &str {
        &self.name
    }
}

/// Returns one page of `items`.
///
/// Items are sorted by sort key ascending. The page starts at the first
/// element whose key is strictly greater than the cursor's decoded key and
/// holds at most `limit` elements. `next_cursor` is emitted iff a full page
/// was returned; a final empty page may therefore follow a full one.
pub fn paginate<T: SortKey>(
    mut items: Vec<T>,
    cursor: Option<&Cursor>,
    limit: usize,
) -> McpResult<(Vec<T>, Option<Cursor>)> {
    items.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));

    let start = match cursor {
        Some(c) if !c.is_empty() => {
            let key = c.decode()?;
            items.partition_point(|e| e.sort_key() <= key.as_str())
        }
        _ => 0,
    };

    let page: Vec<T> = items.into_iter().skip(start).take(limit).collect();

    let next_cursor = if limit > 0 && page.len() >= limit {
        page.last().map(|e| Cursor::encode(e.sort_key()))
    } else {
        None
    };

    Ok((page, next_cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::InputSchema;

    fn tools(n: usize) -> Vec<Tool> {
        (0..n)
            .map(|i| Tool::new(format!("tool_{i}"), format!("tool {i}"), InputSchema::default()))
            .collect()
    }

    #[test]
    fn first_page_sorted_with_cursor() {
        let (page, next) = paginate(tools(10), None, 5).unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].name, "tool_0");
        assert_eq!(page[4].name, "tool_4");
        let next = next.expect("full page emits a cursor");
        assert_eq!(next.decode().unwrap(), "tool_4");
    }

    #[test]
    fn cursor_walk_covers_all_items_without_gaps() {
        let total = 23;
        let limit = 5;
        let mut seen = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let (page, next) = paginate(tools(total), cursor.as_ref(), limit).unwrap();
            seen.extend(page.into_iter().map(|t| t.name));
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        let mut expected: Vec<String> = (0..total).map(|i| format!("tool_{i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn exact_boundary_emits_cursor_then_empty_page() {
        // 10 items, limit 5: second page is full, so a cursor is emitted even
        // though nothing follows; the third page is empty with no cursor.
        let (page1, c1) = paginate(tools(10), None, 5).unwrap();
        assert_eq!(page1.len(), 5);
        let (page2, c2) = paginate(tools(10), c1.as_ref(), 5).unwrap();
        assert_eq!(page2.len(), 5);
        let c2 = c2.expect("full page emits a cursor");
        let (page3, c3) = paginate(tools(10), Some(&c2), 5).unwrap();
        assert!(page3.is_empty());
        assert!(c3.is_none());
    }

    #[test]
    fn bad_cursor_is_an_error() {
        let cursor = Cursor("not-base64!!".into());
        assert!(paginate(tools(3), Some(&cursor), 2).is_err());
    }

    #[test]
    fn resources_page_by_uri() {
        let resources: Vec<Resource> = (0..4)
            .map(|i| Resource {
                uri: format!("file:///{i}.txt"),
                name: format!("r{i}"),
                description: None,
                mime_type: None,
            })
            .collect();
        let (page, next) = paginate(resources, None, 2).unwrap();
        assert_eq!(page[0].uri, "file:///0.txt");
        assert_eq!(next.unwrap().decode().unwrap(), "file:///1.txt");
    }
}
