use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use window_sort::{ChunkSorterBuilder, ColumnType, Datum, KeyComparator, RowBatch, SortKey, Value};

/// Lines per upstream batch.
const BATCH_LINES: usize = 4096;

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let chunk_rows: usize = arg_parser.value_of_t_or_exit("chunk_rows");
    let window: usize = arg_parser.value_of_t_or_exit("window");
    let side_buffer_size = arg_parser.value_of("side_buffer_size");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = arg_parser.value_of("input").expect("value is required");
    let input_stream = fs::File::open(input)
        .map(io::BufReader::new)
        .unwrap_or_else(|err| exit_with("input file opening error", err));

    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = fs::File::create(output)
        .map(io::BufWriter::new)
        .unwrap_or_else(|err| exit_with("output file creation error", err));

    let mut sorter_builder = ChunkSorterBuilder::new()
        .with_schema(vec![ColumnType::VarLen])
        .with_chunk_capacity(chunk_rows)
        .with_window(window);
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }
    if let Some(side_buffer_size) = side_buffer_size {
        let bytes = side_buffer_size.parse::<ByteSize>().expect("value is pre-validated");
        sorter_builder = sorter_builder.with_side_buffer_capacity(bytes.as_u64() as usize);
    }

    let sorter = sorter_builder
        .build()
        .unwrap_or_else(|err| exit_with("sorter initialization error", err));

    let comparator = KeyComparator::new([order.key()]);
    let sorted = sorter
        .sort_by(line_batches(input_stream), &comparator)
        .unwrap_or_else(|err| exit_with("line sorting error", err));

    for chunk in sorted.stream() {
        let chunk = chunk.unwrap_or_else(|err| exit_with("sorted chunk restoring error", err));

        for record in chunk.sorted_records() {
            let line: &[u8] = match record.datum(0) {
                Ok(Datum::Bytes(line)) => line,
                Ok(_) => b"",
                Err(err) => exit_with("sorted line reading error", err),
            };
            output_stream
                .write_all(line)
                .and_then(|_| output_stream.write_all(b"\n"))
                .unwrap_or_else(|err| exit_with("line writing error", err));
        }
    }

    output_stream
        .flush()
        .unwrap_or_else(|err| exit_with("output flushing error", err));
}

fn exit_with(context: &str, err: impl std::fmt::Display) -> ! {
    log::error!("{}: {}", context, err);
    process::exit(1);
}

/// Splits input lines into single-column batches.
fn line_batches(input: impl BufRead) -> impl Iterator<Item = RowBatch> {
    let mut lines = input.split(b'\n');
    let mut batch_id = 0;

    std::iter::from_fn(move || {
        let mut rows = Vec::with_capacity(BATCH_LINES);
        for line in lines.by_ref().take(BATCH_LINES) {
            match line {
                Ok(line) => rows.push(vec![Value::from(line)]),
                Err(err) => exit_with("input reading error", err),
            }
        }

        if rows.is_empty() {
            return None;
        }

        let batch = RowBatch::new(batch_id, 1, rows);
        batch_id += 1;
        Some(batch)
    })
}

/// Values of an [`ArgEnum`] as accepted by the argument parser.
fn possible_values<T: ArgEnum + 'static>() -> impl Iterator<Item = clap::PossibleValue<'static>> {
    T::value_variants().iter().filter_map(|v| v.to_possible_value())
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as ArgEnum>::from_str(s, true)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    /// Sort key of the line column.
    fn key(self) -> SortKey {
        match self {
            Order::Asc => SortKey::asc(0),
            Order::Desc => SortKey::desc(0),
        }
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as ArgEnum>::from_str(s, true)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("window-sort")
        .about("chunked bounded-window line sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file with the lines to sort")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("file to write sorted lines to")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("line order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(possible_values::<Order>()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("log verbosity")
                .takes_value(true)
                .default_value("info")
                .possible_values(possible_values::<LogLevel>()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads running the sorting network lanes")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to spill chunks waiting for a merge to")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_rows")
                .short('c')
                .long("chunk-rows")
                .help("number of lines per chunk")
                .takes_value(true)
                .default_value("65536"),
        )
        .arg(
            clap::Arg::new("side_buffer_size")
                .short('b')
                .long("side-buffer-size")
                .help("line bytes per loaded chunk")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Side buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("window")
                .short('w')
                .long("window")
                .help("maximum number of resident chunks")
                .takes_value(true)
                .default_value("4"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(log_level.into())
        .format_timestamp_millis()
        .init();
}
