//! Text protocol result sets.
//!
//! A query that returns rows answers with:
//!
//! ```text
//! column count (lenenc)
//! column definition × count
//! [EOF]                      (only without CLIENT_DEPRECATE_EOF)
//! row*                       (count lenenc values, 0xFB = NULL)
//! EOF | OK(0xFE) | ERR
//! ```
//!
//! Rows are pulled lazily by [`RowStream`], which borrows the connection
//! until the terminator has been read.

use std::io::{Read, Write};
use std::sync::Arc;

use serde::Serialize;
use sqlwire_core::error::ProtocolError;
use sqlwire_core::{ColumnInfo, Error, Result, Row};

use crate::connection::MySqlConnection;
use crate::protocol::{OkPacket, PacketReader, ServerPacket};
use crate::types::{ColumnDefinition, FieldType};

/// Decode a column definition packet (Protocol::ColumnDefinition41).
pub fn parse_column_definition(payload: &[u8]) -> Result<ColumnDefinition> {
    let mut reader = PacketReader::new(payload);
    let truncated =
        |field: &str| Error::MalformedResultSet(format!("Column definition truncated at {}", field));

    let catalog = reader.read_lenenc_string().ok_or_else(|| truncated("catalog"))?;
    let schema = reader.read_lenenc_string().ok_or_else(|| truncated("schema"))?;
    let table = reader.read_lenenc_string().ok_or_else(|| truncated("table"))?;
    let org_table = reader.read_lenenc_string().ok_or_else(|| truncated("org_table"))?;
    let name = reader.read_lenenc_string().ok_or_else(|| truncated("name"))?;
    let org_name = reader.read_lenenc_string().ok_or_else(|| truncated("org_name"))?;

    // Length of the fixed block, always 0x0C
    let fixed_len = reader
        .read_lenenc_int()
        .ok_or_else(|| truncated("fixed-length fields"))?;
    if fixed_len < 0x0C {
        return Err(Error::MalformedResultSet(format!(
            "Column definition fixed block is {} bytes, expected 12",
            fixed_len
        )));
    }

    let charset = reader.read_u16_le().ok_or_else(|| truncated("character set"))?;
    let column_length = reader.read_u32_le().ok_or_else(|| truncated("column length"))?;
    let column_type = reader.read_u8().ok_or_else(|| truncated("column type"))?;
    let flags = reader.read_u16_le().ok_or_else(|| truncated("flags"))?;
    let decimals = reader.read_u8().ok_or_else(|| truncated("decimals"))?;
    // Two filler bytes follow; some servers omit them

    Ok(ColumnDefinition {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type: FieldType::from_u8(column_type),
        flags,
        decimals,
    })
}

/// Decode a text protocol row into `column_count` raw values.
///
/// `0xFB` marks NULL. A row with too few values, bytes left over, or a
/// length prefix claiming more bytes than remain is rejected.
pub fn parse_text_row(payload: &[u8], column_count: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(column_count);

    for index in 0..column_count {
        match reader.peek() {
            None => {
                return Err(Error::MalformedResultSet(format!(
                    "Row has {} values, expected {}",
                    index, column_count
                )));
            }
            Some(0xFB) => {
                reader.skip(1);
                values.push(None);
            }
            Some(_) => {
                let len = reader.read_lenenc_int().ok_or_else(|| {
                    Error::MalformedResultSet(format!("Invalid length prefix in column {}", index))
                })?;
                let available = reader.remaining();
                let bytes = usize::try_from(len)
                    .ok()
                    .and_then(|len| reader.read_bytes(len))
                    .ok_or_else(|| {
                        Error::MalformedResultSet(format!(
                            "Column {} claims {} bytes but only {} remain",
                            index, len, available
                        ))
                    })?;
                values.push(Some(bytes.to_vec()));
            }
        }
    }

    if !reader.is_empty() {
        return Err(Error::MalformedResultSet(format!(
            "{} trailing bytes after {} values",
            reader.remaining(),
            column_count
        )));
    }

    Ok(values)
}

/// A fully read result set.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    /// Column metadata in order
    pub columns: Vec<ColumnDefinition>,
    /// Rows in the order the server sent them
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Get the column names.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Get the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result set has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Response to a text query, with rows still on the wire.
pub enum QueryResult<'c, S: Read + Write> {
    /// The statement returned no result set
    Ok(OkPacket),
    /// Column metadata has been read; rows follow
    Rows(RowStream<'c, S>),
}

/// Response to a text query, fully read.
#[derive(Debug, Clone, Serialize)]
pub enum QueryOutcome {
    /// The statement returned no result set
    Ok(OkPacket),
    /// The statement returned rows
    ResultSet(ResultSet),
}

impl<S: Read + Write> std::fmt::Debug for QueryResult<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryResult::Ok(ok) => f.debug_tuple("Ok").field(ok).finish(),
            QueryResult::Rows(stream) => f.debug_tuple("Rows").field(stream).finish(),
        }
    }
}

impl<S: Read + Write> QueryResult<'_, S> {
    /// Read any remaining rows and release the connection.
    pub fn into_outcome(self) -> Result<QueryOutcome> {
        match self {
            QueryResult::Ok(ok) => Ok(QueryOutcome::Ok(ok)),
            QueryResult::Rows(stream) => stream.collect_all().map(QueryOutcome::ResultSet),
        }
    }
}

/// Lazily decoded rows of a result set.
///
/// The stream holds the connection until the terminator packet has been
/// read. Dropping it early reads and discards the remaining rows.
pub struct RowStream<'c, S: Read + Write> {
    conn: &'c mut MySqlConnection<S>,
    columns: Vec<ColumnDefinition>,
    info: Arc<ColumnInfo>,
    done: bool,
}

impl<S: Read + Write> std::fmt::Debug for RowStream<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.info.names())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'c, S: Read + Write> RowStream<'c, S> {
    pub(crate) fn new(conn: &'c mut MySqlConnection<S>, columns: Vec<ColumnDefinition>) -> Self {
        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        Self {
            conn,
            columns,
            info,
            done: false,
        }
    }

    /// Get the column metadata.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Get the column names shared by every row.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.info)
    }

    /// Check whether the terminator has been read.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Read every remaining row.
    pub fn collect_all(mut self) -> Result<ResultSet> {
        let mut rows = Vec::new();
        for row in self.by_ref() {
            rows.push(row?);
        }
        Ok(ResultSet {
            columns: std::mem::take(&mut self.columns),
            rows,
        })
    }

    fn read_row(&mut self) -> Result<Option<Row>> {
        let payload = self.conn.read_packet()?;
        let capabilities = self.conn.capabilities();

        let packet = match ServerPacket::result_row(&payload, capabilities) {
            Ok(packet) => packet,
            Err(message) => {
                return Err(self.conn.fail(Error::Protocol(ProtocolError {
                    message,
                    raw_data: Some(payload.clone()),
                    source: None,
                })));
            }
        };

        match packet {
            ServerPacket::Data(data) => match parse_text_row(data, self.columns.len()) {
                Ok(values) => Ok(Some(Row::with_columns(Arc::clone(&self.info), values))),
                Err(e) => Err(self.conn.fail(e)),
            },
            ServerPacket::Eof(eof) => {
                self.conn.finish_command(eof.status_flags, eof.warnings);
                Ok(None)
            }
            ServerPacket::Ok(ok) => {
                self.conn.finish_command(ok.status_flags, ok.warnings);
                Ok(None)
            }
            ServerPacket::Err(err) => Err(self.conn.fail(Error::Server(err.into()))),
            ServerPacket::LocalInfile(_) => Err(self.conn.fail(Error::Protocol(ProtocolError {
                message: "Unexpected packet inside a result set".to_string(),
                raw_data: Some(payload.clone()),
                source: None,
            }))),
        }
    }
}

impl<S: Read + Write> Iterator for RowStream<'_, S> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<S: Read + Write> Drop for RowStream<'_, S> {
    fn drop(&mut self) {
        let mut drained = 0usize;
        while let Some(row) = self.next() {
            if row.is_err() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(rows = drained, "Discarded unread rows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::column_flags;

    fn column_payload(name: &str, column_type: u8, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("shop");
        w.write_lenenc_string("o");
        w.write_lenenc_string("orders");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0C);
        w.write_u16_le(63);
        w.write_u32_le(20);
        w.write_u8(column_type);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    #[test]
    fn test_parse_column_definition() {
        let payload = column_payload(
            "id",
            0x08,
            column_flags::NOT_NULL | column_flags::PRIMARY_KEY,
        );
        let col = parse_column_definition(&payload).unwrap();

        assert_eq!(col.catalog, "def");
        assert_eq!(col.schema, "shop");
        assert_eq!(col.table, "o");
        assert_eq!(col.org_table, "orders");
        assert_eq!(col.name, "id");
        assert_eq!(col.charset, 63);
        assert_eq!(col.column_length, 20);
        assert_eq!(col.column_type, FieldType::LongLong);
        assert!(col.flags & column_flags::PRIMARY_KEY != 0);
        assert_eq!(col.decimals, 0);
    }

    #[test]
    fn test_parse_column_definition_without_filler() {
        let payload = column_payload("id", 0x03, 0);
        let col = parse_column_definition(&payload[..payload.len() - 2]).unwrap();
        assert_eq!(col.column_type, FieldType::Long);
    }

    #[test]
    fn test_parse_column_definition_truncated() {
        let payload = column_payload("id", 0x03, 0);
        for cut in [0, 3, 20, payload.len() - 4] {
            assert!(
                matches!(
                    parse_column_definition(&payload[..cut]),
                    Err(Error::MalformedResultSet(_))
                ),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_parse_text_row() {
        let payload = [0x01, b'1', 0xFB, 0x00, 0x03, b'a', b'b', b'c'];
        let values = parse_text_row(&payload, 4).unwrap();
        assert_eq!(
            values,
            vec![
                Some(b"1".to_vec()),
                None,
                Some(Vec::new()),
                Some(b"abc".to_vec())
            ]
        );
    }

    #[test]
    fn test_parse_text_row_too_few_values() {
        let err = parse_text_row(&[0x01, b'1'], 2).unwrap_err();
        assert!(matches!(err, Error::MalformedResultSet(ref m) if m.contains("1 values, expected 2")));
    }

    #[test]
    fn test_parse_text_row_trailing_bytes() {
        let err = parse_text_row(&[0x01, b'1', 0x01, b'2'], 1).unwrap_err();
        assert!(matches!(err, Error::MalformedResultSet(ref m) if m.contains("trailing")));
    }

    #[test]
    fn test_parse_text_row_overlong_prefix() {
        let err = parse_text_row(&[0x05, b'a', b'b'], 1).unwrap_err();
        assert!(matches!(err, Error::MalformedResultSet(ref m) if m.contains("claims 5 bytes")));

        // 8-byte prefix far beyond the packet
        let err = parse_text_row(&[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0], 1).unwrap_err();
        assert!(matches!(err, Error::MalformedResultSet(_)));
    }

    #[test]
    fn test_parse_text_row_no_columns() {
        assert!(parse_text_row(&[], 0).unwrap().is_empty());
    }
}
