//! Result materialization.
//!
//! Turns a cursor (statement columns plus a boxed row stream borrowed from the
//! connection) into host values, either buffered into a `ResultTable` or handed
//! row by row to a callback. The stream is owned here and dropped on every exit
//! path, which releases the cursor on success, on an empty result and on a
//! decode failure.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use crate::db::connection::{ColumnReader, Cursor, Step};
use crate::db::marshal::TypeMarshaller;
use crate::error::DbResult;
use crate::models::{ColumnDescriptor, ExecuteOutcome, HostValue, ResultTable};

/// Decodes cursors through a `TypeMarshaller`.
#[derive(Debug, Clone, Copy)]
pub struct ResultMaterializer<'m> {
    marshaller: &'m TypeMarshaller,
}

impl<'m> ResultMaterializer<'m> {
    pub fn new(marshaller: &'m TypeMarshaller) -> Self {
        Self { marshaller }
    }

    /// Buffer the whole cursor, keeping at most `max_rows` rows.
    ///
    /// One row past the limit is read to tell whether the result was truncated.
    /// Column types come from the first row when there is one, since SQLite
    /// types values rather than columns; an empty result keeps the statement's
    /// columns.
    pub async fn buffered<R: ColumnReader>(
        &self,
        cursor: Cursor<'_, R>,
        max_rows: Option<usize>,
    ) -> DbResult<ResultTable> {
        let Cursor { columns, mut rows } = cursor;
        let mut table = ResultTable::default();
        let mut described = false;

        while let Some(row) = rows.next().await {
            let row = row?;
            if !described {
                table.columns = self.marshaller.describe(&row.column_meta());
                described = true;
            }
            if max_rows.is_some_and(|max| table.rows.len() >= max) {
                table.truncated = true;
                break;
            }
            table.rows.push(self.marshaller.decode_row(&row, &table.columns)?);
        }
        if !described {
            table.columns = self.marshaller.describe(&columns);
        }

        debug!(
            rows = table.rows.len(),
            truncated = table.truncated,
            "Materialized result"
        );
        Ok(table)
    }

    /// Decode each row and hand it to `on_row`; returns the number of rows seen.
    ///
    /// An error from `on_row` stops iteration and is returned as is.
    pub async fn streaming<R, F>(
        &self,
        cursor: Cursor<'_, R>,
        mut on_row: F,
    ) -> DbResult<u64>
    where
        R: ColumnReader,
        F: FnMut(&[ColumnDescriptor], Vec<HostValue>) -> DbResult<()>,
    {
        let mut rows = cursor.rows;
        let mut columns: Option<Vec<ColumnDescriptor>> = None;
        let mut count = 0u64;

        while let Some(row) = rows.next().await {
            let row = row?;
            let columns =
                columns.get_or_insert_with(|| self.marshaller.describe(&row.column_meta()));
            let values = self.marshaller.decode_row(&row, columns)?;
            on_row(columns, values)?;
            count += 1;
        }
        Ok(count)
    }

    /// Collapse a multi-statement step stream into the outcome of `execute`.
    ///
    /// When any statement produced rows the last row-producing statement's table
    /// is returned; otherwise the affected-row counts are summed. Unprepared
    /// statements carry no column metadata, so a query matching no rows counts
    /// as a statement without a result set.
    pub async fn steps<R: ColumnReader>(
        &self,
        mut steps: BoxStream<'_, DbResult<Step<R>>>,
    ) -> DbResult<ExecuteOutcome> {
        let mut current: Option<ResultTable> = None;
        let mut last_table: Option<ResultTable> = None;
        let mut rows_affected = 0u64;

        while let Some(step) = steps.next().await {
            match step? {
                Step::Row(row) => {
                    let table = current.get_or_insert_with(|| {
                        ResultTable::new(self.marshaller.describe(&row.column_meta()))
                    });
                    let values = self.marshaller.decode_row(&row, &table.columns)?;
                    table.rows.push(values);
                }
                Step::Done { rows_affected: n } => {
                    rows_affected += n;
                    if let Some(table) = current.take() {
                        last_table = Some(table);
                    }
                }
            }
        }
        if let Some(table) = current.take() {
            last_table = Some(table);
        }

        Ok(match last_table {
            Some(table) => ExecuteOutcome::Table(table),
            None => ExecuteOutcome::RowsAffected { rows_affected },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::ColumnMeta;
    use crate::db::dialect::Dialect;
    use crate::db::marshal::MarshalOptions;
    use crate::db::mock::{CursorGuard, MockCell, MockRow};
    use crate::error::DbError;
    use futures_util::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn marshaller() -> TypeMarshaller {
        TypeMarshaller::new(Dialect::generic(), MarshalOptions::default())
    }

    fn rows(cells: Vec<Vec<MockCell>>) -> Vec<DbResult<MockRow>> {
        cells
            .into_iter()
            .map(|row| Ok(MockRow::new(vec![("id", "INTEGER"), ("name", "VARCHAR")], row)))
            .collect()
    }

    fn cursor(rows: Vec<DbResult<MockRow>>) -> Cursor<'static, MockRow> {
        let columns = vec![
            ColumnMeta::new("id", "INTEGER"),
            ColumnMeta::new("name", "VARCHAR"),
        ];
        Cursor::new(columns, stream::iter(rows).boxed())
    }

    fn sample() -> Vec<DbResult<MockRow>> {
        rows(vec![
            vec![MockCell::Int(1), MockCell::Text("a".into())],
            vec![MockCell::Int(2), MockCell::Null],
        ])
    }

    #[tokio::test]
    async fn test_buffered_table() {
        let m = marshaller();
        let table = ResultMaterializer::new(&m)
            .buffered(cursor(sample()), None)
            .await
            .unwrap();
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(table.columns[0].ordinal, 1);
        assert_eq!(
            table.rows,
            vec![
                vec![HostValue::Integer(1), HostValue::Text("a".into())],
                vec![HostValue::Integer(2), HostValue::Null],
            ]
        );
        assert!(!table.truncated);
    }

    #[tokio::test]
    async fn test_buffered_max_rows() {
        let m = marshaller();
        let table = ResultMaterializer::new(&m)
            .buffered(cursor(sample()), Some(1))
            .await
            .unwrap();
        assert_eq!(table.row_count(), 1);
        assert!(table.truncated);

        let exact = ResultMaterializer::new(&m)
            .buffered(cursor(sample()), Some(2))
            .await
            .unwrap();
        assert!(!exact.truncated);
    }

    #[tokio::test]
    async fn test_empty_result() {
        let m = marshaller();
        let table = ResultMaterializer::new(&m)
            .buffered(cursor(Vec::new()), None)
            .await
            .unwrap();
        assert!(table.is_empty());
        assert_eq!(table.column_names(), vec!["id", "name"]);
        assert_eq!(table.columns[1].ordinal, 2);
    }

    #[tokio::test]
    async fn test_cursor_released_on_decode_failure() {
        let m = marshaller();
        let open = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let guard = CursorGuard::open(open.clone());
            let failing = rows(vec![
                vec![MockCell::Int(1), MockCell::Text("a".into())],
                vec![MockCell::Fail, MockCell::Null],
                vec![MockCell::Int(3), MockCell::Null],
            ]);
            let rows = stream::iter(failing)
                .map(move |row| {
                    let _held = &guard;
                    row
                })
                .boxed();
            let err = ResultMaterializer::new(&m)
                .buffered(Cursor::new(Vec::new(), rows), None)
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::Marshal { .. }));
        }
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_streaming_callback() {
        let m = marshaller();
        let mut seen = Vec::new();
        let count = ResultMaterializer::new(&m)
            .streaming(cursor(sample()), |columns, values| {
                assert_eq!(columns.len(), 2);
                seen.push(values);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen[1], vec![HostValue::Integer(2), HostValue::Null]);
    }

    #[tokio::test]
    async fn test_streaming_callback_error_stops() {
        let m = marshaller();
        let mut calls = 0;
        let err = ResultMaterializer::new(&m)
            .streaming(cursor(sample()), |_, _| {
                calls += 1;
                Err(DbError::internal("stop"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, DbError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_steps_outcome() {
        let m = marshaller();
        let updates: Vec<DbResult<Step<MockRow>>> = vec![
            Ok(Step::Done { rows_affected: 2 }),
            Ok(Step::Done { rows_affected: 3 }),
        ];
        let outcome = ResultMaterializer::new(&m)
            .steps(stream::iter(updates).boxed())
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected(), Some(5));

        let mut mixed: Vec<DbResult<Step<MockRow>>> = vec![Ok(Step::Done { rows_affected: 1 })];
        mixed.extend(sample().into_iter().map(|r| r.map(Step::Row)));
        mixed.push(Ok(Step::Done { rows_affected: 0 }));
        let table = ResultMaterializer::new(&m)
            .steps(stream::iter(mixed).boxed())
            .await
            .unwrap()
            .into_table()
            .unwrap();
        assert_eq!(table.row_count(), 2);
    }
}
