use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::FeedError;

pub fn candle_schema() -> Schema {
    Schema::new(vec![
        Field::new("bucket_start", DataType::Int64, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("open", DataType::Utf8, false),
        Field::new("high", DataType::Utf8, false),
        Field::new("low", DataType::Utf8, false),
        Field::new("close", DataType::Utf8, false),
        Field::new("volume", DataType::Utf8, false),
    ])
}

fn decimal_column(candles: &[Candle], field: impl Fn(&Candle) -> Decimal) -> ArrayRef {
    let values: Vec<String> = candles.iter().map(|c| field(c).to_string()).collect();
    Arc::new(StringArray::from(
        values.iter().map(|s| s.as_str()).collect::<Vec<&str>>(),
    ))
}

pub fn candles_to_record_batch(candles: &[Candle]) -> Result<RecordBatch, FeedError> {
    let schema = Arc::new(candle_schema());

    let buckets: Vec<i64> = candles.iter().map(|c| c.bucket_start).collect();
    let symbols: Vec<&str> = candles.iter().map(|c| c.symbol.as_str()).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(buckets)),
        Arc::new(StringArray::from(symbols)),
        decimal_column(candles, |c| c.open),
        decimal_column(candles, |c| c.high),
        decimal_column(candles, |c| c.low),
        decimal_column(candles, |c| c.close),
        decimal_column(candles, |c| c.volume),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    index: usize,
    name: &str,
) -> Result<&'a StringArray, FeedError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| FeedError::InvalidData(format!("expected {name} column")))
}

fn parse_decimal(column: &StringArray, row: usize, name: &str) -> Result<Decimal, FeedError> {
    column
        .value(row)
        .parse()
        .map_err(|e| FeedError::InvalidData(format!("invalid {name}: {e}")))
}

pub fn record_batch_to_candles(batch: &RecordBatch) -> Result<Vec<Candle>, FeedError> {
    let buckets = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| FeedError::InvalidData("expected bucket_start column".into()))?;
    let symbols = string_column(batch, 1, "symbol")?;
    let opens = string_column(batch, 2, "open")?;
    let highs = string_column(batch, 3, "high")?;
    let lows = string_column(batch, 4, "low")?;
    let closes = string_column(batch, 5, "close")?;
    let volumes = string_column(batch, 6, "volume")?;

    let mut candles = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        candles.push(Candle {
            bucket_start: buckets.value(i),
            symbol: symbols.value(i).to_string(),
            open: parse_decimal(opens, i, "open")?,
            high: parse_decimal(highs, i, "high")?,
            low: parse_decimal(lows, i, "low")?,
            close: parse_decimal(closes, i, "close")?,
            volume: parse_decimal(volumes, i, "volume")?,
        });
    }

    Ok(candles)
}

pub fn write_parquet(path: &Path, candles: &[Candle]) -> Result<(), FeedError> {
    let batch = candles_to_record_batch(candles)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<Candle>, FeedError> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut all_candles = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut candles = record_batch_to_candles(&batch)?;
        all_candles.append(&mut candles);
    }

    Ok(all_candles)
}
