// Result streaming: couple a warehouse cursor to a chunked JSON response.
//
// The envelope prologue is emitted before the first row is fetched; rows are
// encoded one at a time as the consumer drains the stream, so the cursor's
// pace is set by the client. On a mid-stream failure the producer logs and
// stops without emitting the epilogue, leaving the envelope unterminated so
// the transport surfaces the truncation.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::error;

use crate::warehouse::RowStream;

/// Name of the array holding result rows, unless a caller overrides it.
pub const DEFAULT_RESULT_NAME: &str = "query_result";

/// Turn a row cursor into encoded chunks of one JSON document:
///
/// ```text
/// { <additional_elements...>, "<result_name>":[ <row0>, <row1>, ... ] }
/// ```
pub fn stream_result_as_json(
    mut rows: RowStream,
    result_name: &str,
    additional_elements: &[(&str, Value)],
) -> impl Stream<Item = Bytes> + Send {
    let mut prologue = String::from("{");
    for (key, value) in additional_elements {
        prologue.push_str(&format!("{}:{}, ", Value::from(*key), value));
    }
    prologue.push_str(&format!("{}:[", Value::from(result_name)));

    async_stream::stream! {
        yield Bytes::from(prologue);
        let mut prepend = "";
        while let Some(row) = rows.next().await {
            match row {
                Ok(row) => {
                    yield Bytes::from(format!("{prepend}{}", Value::Object(row)));
                    prepend = ", ";
                }
                Err(err) => {
                    // Truncate: no epilogue, the document stays unclosed.
                    error!(error = %err, "result stream terminated");
                    return;
                }
            }
        }
        yield Bytes::from_static(b"]}");
    }
}
