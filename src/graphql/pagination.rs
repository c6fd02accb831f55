//! Cursor-based pagination
//!
//! Paginated queries return a Relay style connection. Cursors are opaque
//! encodings of the absolute row offset within the ordered, filtered result,
//! so `after`/`before` stay meaningful as long as the ordering is stable
//! (ordering always ends with the primary key).

use async_graphql::dynamic::{Field, FieldFuture, FieldValue, Object, TypeRef};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use super::ModelEntry;
use crate::error::{FilterError, coded_error};
use crate::schema::SchemaSettings;
use crate::store::{Record, StoreQuery};

pub const PAGE_INFO: &str = "PageInfo";

/// Information about pagination in a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub total_count: usize,
}

/// An edge in a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub node: Record,
    pub cursor: String,
}

/// One page of rows
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
}

impl Connection {
    /// Build from the rows found at `offset` out of `total` matches.
    pub fn from_rows(rows: Vec<Record>, offset: usize, total: usize) -> Self {
        let has_next_page = offset.saturating_add(rows.len()) < total;
        let has_previous_page = offset > 0;

        let edges: Vec<Edge> = rows
            .into_iter()
            .enumerate()
            .map(|(i, node)| Edge {
                cursor: encode_cursor(offset + i),
                node,
            })
            .collect();

        let page_info = PageInfo {
            has_next_page,
            has_previous_page,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
            total_count: total,
        };

        Self { edges, page_info }
    }
}

/// Encode an offset as a cursor string
pub fn encode_cursor(offset: usize) -> String {
    BASE64.encode(format!("cursor:{}", offset))
}

/// Decode a cursor string to an offset
pub fn decode_cursor(cursor: &str) -> Result<usize, FilterError> {
    let invalid = || FilterError::InvalidCursor(cursor.to_string());
    let decoded = BASE64.decode(cursor).map_err(|_| invalid())?;
    let s = String::from_utf8(decoded).map_err(|_| invalid())?;
    s.strip_prefix("cursor:")
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())
}

/// Pagination arguments after cursor decoding and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// First offset that may be returned
    pub start: usize,
    /// Exclusive upper offset from `before`
    pub end: Option<usize>,
    pub first: Option<usize>,
    pub last: Option<usize>,
}

impl PageRequest {
    /// `first` defaults to the page size when neither `first` nor `last` is
    /// given; both are clamped to `[0, page_size_max]`.
    pub fn parse(
        first: Option<i64>,
        after: Option<&str>,
        last: Option<i64>,
        before: Option<&str>,
        settings: &SchemaSettings,
    ) -> Result<Self, FilterError> {
        let clamp = |n: i64| n.clamp(0, settings.page_size_max as i64) as usize;
        let first = match (first, last) {
            (None, None) => Some(settings.page_size_default.min(settings.page_size_max)),
            (first, _) => first.map(clamp),
        };
        let start = match after {
            Some(cursor) => decode_cursor(cursor)?
                .checked_add(1)
                .ok_or_else(|| FilterError::InvalidCursor(cursor.to_string()))?,
            None => 0,
        };
        let end = before.map(decode_cursor).transpose()?;
        Ok(Self {
            start,
            end,
            first,
            last: last.map(clamp),
        })
    }

    /// `last` without `before` can only be placed once the total is known.
    pub fn needs_total(&self) -> bool {
        self.last.is_some() && self.end.is_none()
    }

    /// Narrow `base` to this page. When [Self::needs_total] the store
    /// places the tail itself, so one read returns both rows and total.
    pub fn query(&self, base: StoreQuery) -> StoreQuery {
        match self.last {
            Some(last) if self.end.is_none() => base.window(self.start, self.first).tail(last),
            _ => {
                let (offset, limit) = self.window(None);
                base.window(offset, limit)
            }
        }
    }

    /// Offset and limit to request. `total` is required when [Self::needs_total].
    pub fn window(&self, total: Option<usize>) -> (usize, Option<usize>) {
        let mut end = self.end.or(if self.last.is_some() { total } else { None });
        if let Some(first) = self.first {
            let capped = self.start.saturating_add(first);
            end = Some(end.map_or(capped, |e| e.min(capped)));
        }
        let Some(end) = end.map(|e| e.max(self.start)) else {
            return (self.start, None);
        };
        match self.last {
            Some(last) => {
                let offset = end.saturating_sub(last).max(self.start);
                (offset, Some(end - offset))
            }
            None => (self.start, Some(end - self.start)),
        }
    }
}

fn connection_of<'a>(value: &'a FieldValue<'a>) -> async_graphql::Result<&'a Connection> {
    value
        .downcast_ref::<Connection>()
        .ok_or_else(|| coded_error("GENERAL", "parent value is not a connection"))
}

/// Shared `PageInfo` object.
pub fn page_info_type() -> Object {
    let field = |name: &str, ty: TypeRef, get: fn(&PageInfo) -> FieldValue<'static>| {
        Field::new(name, ty, move |ctx| {
            FieldFuture::new(async move {
                let info = ctx
                    .parent_value
                    .downcast_ref::<PageInfo>()
                    .ok_or_else(|| coded_error("GENERAL", "parent value is not page info"))?;
                Ok(Some(get(info)))
            })
        })
    };
    Object::new(PAGE_INFO)
        .description("Information about pagination in a connection")
        .field(field("hasNextPage", TypeRef::named_nn(TypeRef::BOOLEAN), |i| {
            FieldValue::value(i.has_next_page)
        }))
        .field(field("hasPreviousPage", TypeRef::named_nn(TypeRef::BOOLEAN), |i| {
            FieldValue::value(i.has_previous_page)
        }))
        .field(field("startCursor", TypeRef::named(TypeRef::STRING), |i| {
            i.start_cursor.clone().map(FieldValue::value).unwrap_or(FieldValue::NULL)
        }))
        .field(field("endCursor", TypeRef::named(TypeRef::STRING), |i| {
            i.end_cursor.clone().map(FieldValue::value).unwrap_or(FieldValue::NULL)
        }))
        .field(field("totalCount", TypeRef::named_nn(TypeRef::INT), |i| {
            FieldValue::value(i.total_count as i64)
        }))
}

/// `<Model>Edge` for `entry`.
pub fn edge_type(entry: &ModelEntry) -> Object {
    Object::new(&entry.names.edge)
        .field(Field::new(
            "node",
            TypeRef::named_nn(&entry.names.object),
            |ctx| {
                FieldFuture::new(async move {
                    let edge = ctx
                        .parent_value
                        .downcast_ref::<Edge>()
                        .ok_or_else(|| coded_error("GENERAL", "parent value is not an edge"))?;
                    Ok(Some(FieldValue::borrowed_any(&edge.node)))
                })
            },
        ))
        .field(Field::new("cursor", TypeRef::named_nn(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let edge = ctx
                    .parent_value
                    .downcast_ref::<Edge>()
                    .ok_or_else(|| coded_error("GENERAL", "parent value is not an edge"))?;
                Ok(Some(FieldValue::value(edge.cursor.clone())))
            })
        }))
}

/// `<Model>Connection` for `entry`.
pub fn connection_type(entry: &ModelEntry) -> Object {
    Object::new(&entry.names.connection)
        .description(format!("A page of {}", entry.names.plural))
        .field(Field::new(
            "edges",
            TypeRef::named_nn_list_nn(&entry.names.edge),
            |ctx| {
                FieldFuture::new(async move {
                    let conn = connection_of(ctx.parent_value)?;
                    Ok(Some(FieldValue::list(
                        conn.edges.iter().map(|edge| FieldValue::borrowed_any(edge)),
                    )))
                })
            },
        ))
        .field(Field::new("pageInfo", TypeRef::named_nn(PAGE_INFO), |ctx| {
            FieldFuture::new(async move {
                let conn = connection_of(ctx.parent_value)?;
                Ok(Some(FieldValue::borrowed_any(&conn.page_info)))
            })
        }))
        .field(Field::new("totalCount", TypeRef::named_nn(TypeRef::INT), |ctx| {
            FieldFuture::new(async move {
                let conn = connection_of(ctx.parent_value)?;
                Ok(Some(FieldValue::value(conn.page_info.total_count as i64)))
            })
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn settings() -> SchemaSettings {
        SchemaSettings::default()
    }

    #[test]
    fn test_cursor_roundtrip() {
        for offset in [0, 1, 100, 999999] {
            let cursor = encode_cursor(offset);
            assert_eq!(decode_cursor(&cursor).unwrap(), offset);
        }
        assert_matches!(decode_cursor("garbage!"), Err(FilterError::InvalidCursor(_)));
        assert_matches!(
            decode_cursor(&BASE64.encode("offset:3")),
            Err(FilterError::InvalidCursor(_))
        );
    }

    #[test]
    fn test_default_and_max_limit() {
        let req = PageRequest::parse(None, None, None, None, &settings()).unwrap();
        assert_eq!(req.window(None), (0, Some(25)));

        let req = PageRequest::parse(Some(1000), None, None, None, &settings()).unwrap();
        assert_eq!(req.window(None), (0, Some(100)));

        let req = PageRequest::parse(Some(-4), None, None, None, &settings()).unwrap();
        assert_eq!(req.window(None), (0, Some(0)));
    }

    #[test]
    fn test_after_and_before() {
        let after = encode_cursor(10);
        let req = PageRequest::parse(Some(5), Some(&after), None, None, &settings()).unwrap();
        assert_eq!(req.window(None), (11, Some(5)));

        // first is cut short by before
        let before = encode_cursor(13);
        let req = PageRequest::parse(Some(5), Some(&after), None, Some(&before), &settings()).unwrap();
        assert_eq!(req.window(None), (11, Some(2)));

        // last before a cursor
        let req = PageRequest::parse(None, None, Some(3), Some(&before), &settings()).unwrap();
        assert!(!req.needs_total());
        assert_eq!(req.window(None), (10, Some(3)));
    }

    #[test]
    fn test_last_needs_total() {
        let req = PageRequest::parse(None, None, Some(4), None, &settings()).unwrap();
        assert!(req.needs_total());
        assert_eq!(req.window(Some(10)), (6, Some(4)));
        assert_eq!(req.window(Some(2)), (0, Some(2)));
    }

    #[test]
    fn test_cursor_offsets_near_the_limit() {
        let last_offset = BASE64.encode(format!("cursor:{}", usize::MAX));
        assert_matches!(
            PageRequest::parse(None, Some(&last_offset), None, None, &settings()),
            Err(FilterError::InvalidCursor(_))
        );

        let near_end = encode_cursor(usize::MAX - 1);
        let req = PageRequest::parse(Some(2), Some(&near_end), None, None, &settings()).unwrap();
        assert_eq!(req.window(None), (usize::MAX, Some(0)));

        let too_big = BASE64.encode("cursor:18446744073709551616000");
        assert_matches!(decode_cursor(&too_big), Err(FilterError::InvalidCursor(_)));
        assert_matches!(
            decode_cursor(&BASE64.encode("cursor:-3")),
            Err(FilterError::InvalidCursor(_))
        );
    }

    #[test]
    fn test_last_is_placed_by_the_store() {
        let req = PageRequest::parse(Some(5), None, Some(2), None, &settings()).unwrap();
        let query = req.query(StoreQuery::new("t"));
        assert_eq!((query.offset, query.limit, query.tail), (0, Some(5), Some(2)));
        assert_eq!(query.resolved_window(9), req.window(Some(9)));
        assert_eq!(query.resolved_window(3), req.window(Some(3)));

        let before = encode_cursor(6);
        let req = PageRequest::parse(None, None, Some(2), Some(&before), &settings()).unwrap();
        let query = req.query(StoreQuery::new("t"));
        assert_eq!((query.offset, query.limit, query.tail), (4, Some(2), None));
    }

    #[test]
    fn test_connection_boundaries() {
        let rows: Vec<Record> = (0..3).map(|_| Record::new()).collect();
        let first = Connection::from_rows(rows.clone(), 0, 5);
        assert!(first.page_info.has_next_page);
        assert!(!first.page_info.has_previous_page);
        assert_eq!(first.page_info.start_cursor, Some(encode_cursor(0)));

        let last = Connection::from_rows(rows[..2].to_vec(), 3, 5);
        assert!(!last.page_info.has_next_page);
        assert!(last.page_info.has_previous_page);
        assert_eq!(last.page_info.end_cursor, Some(encode_cursor(4)));

        let empty = Connection::from_rows(Vec::new(), 0, 0);
        assert_eq!(empty.page_info.start_cursor, None);
        assert!(!empty.page_info.has_next_page);
    }
}
